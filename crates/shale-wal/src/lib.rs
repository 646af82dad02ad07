//! Write-ahead log for shale.
//!
//! The log is an unbounded sequence of fixed-capacity *partition* files,
//! each written through a circular in-memory insert buffer one *segment*
//! in size. Writers reserve contiguous buffer ranges through a
//! consolidation array ([`carray`]), copy their record bytes without
//! holding the insert gate, and publish completion; a single flush daemon
//! turns the contiguous completed prefix into durable bytes under a
//! group-commit policy.
//!
//! Record semantics (construct / redo / undo) live in [`logrec`]; readers
//! (recovery, rollback) go through per-partition fetch buffers that only
//! ever touch durable bytes.

pub mod carray;
pub mod log;
pub mod logrec;
pub mod storage;
pub mod tracker;

pub use log::{LogConfig, LogManager, LogScan};
pub use logrec::{LogPayload, LogRecord, LogRecordKind, RedoPage, UndoOps};
pub use tracker::OldestLsnTracker;
