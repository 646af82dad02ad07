//! Error types for shale.
//!
//! One structured enum for the whole engine. Two deliberate non-errors:
//! lock-retry (the lock manager released latches to wait cleanly) is a
//! successful outcome of `acquire` and lives in `shale-lock`, and redo
//! skipping (record LSN ≤ page LSN) is ordinary control flow in recovery.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used across every shale crate.
pub type Result<T> = std::result::Result<T, ShaleError>;

/// Primary error type for shale operations.
#[derive(Error, Debug)]
pub enum ShaleError {
    /// The volume cannot grow or a store ran out of extents.
    #[error("out of space: {detail}")]
    OutOfSpace { detail: String },

    /// Every buffer-pool frame is pinned and the caller opted out of
    /// eviction.
    #[error("buffer pool is full")]
    BufferFull,

    /// A blocking lock wait exceeded the configured timeout.
    #[error("lock timeout after {waited_ms} ms ({holder} holds the lock)")]
    LockTimeout { waited_ms: u64, holder: u64 },

    /// This transaction was chosen as the deadlock victim and must abort.
    #[error("deadlock victim: transaction {txn}")]
    Deadlock { txn: u64 },

    /// A page image failed validation (checksum, type, or structure).
    #[error("page {pid} corrupt: {detail}")]
    PageCorrupt { pid: u32, detail: String },

    /// The log insert buffer cannot hold a record of this size.
    #[error("log record of {size} bytes exceeds the log buffer")]
    LogFull { size: usize },

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal invariant was violated; the engine state is suspect.
    #[error("internal invariant violated: {detail}")]
    InternalInvariant { detail: String },

    /// A write conflicted with committed state (duplicate key on insert).
    #[error("conflict on store {store}: {detail}")]
    Conflict { store: u32, detail: String },

    /// Lookup/update/remove target key does not exist.
    #[error("key not found in store {store}")]
    KeyNotFound { store: u32 },

    /// A record (key + value) exceeds what a single page can hold.
    #[error("record of {size} bytes does not fit a page")]
    RecordTooLarge { size: usize },

    /// The volume file is missing or not a shale volume.
    #[error("not a shale volume: '{path}'")]
    NotAVolume { path: PathBuf },

    /// Operation requires an active transaction, or the transaction has
    /// already ended.
    #[error("transaction {txn} is not active")]
    TxnNotActive { txn: u64 },

    /// The named store does not exist in this volume.
    #[error("no such store: {store}")]
    NoSuchStore { store: u32 },
}

impl ShaleError {
    /// Shorthand for [`ShaleError::InternalInvariant`].
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::InternalInvariant {
            detail: detail.into(),
        }
    }

    /// Shorthand for [`ShaleError::PageCorrupt`].
    #[must_use]
    pub fn corrupt(pid: u32, detail: impl Into<String>) -> Self {
        Self::PageCorrupt {
            pid,
            detail: detail.into(),
        }
    }

    /// True for errors a caller may recover from by retrying the
    /// operation (possibly after waking the evictioner).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BufferFull | Self::LockTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let e = ShaleError::corrupt(12, "bad checksum");
        assert_eq!(e.to_string(), "page 12 corrupt: bad checksum");
        let e = ShaleError::Deadlock { txn: 9 };
        assert_eq!(e.to_string(), "deadlock victim: transaction 9");
    }

    #[test]
    fn io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let e: ShaleError = io.into();
        assert!(matches!(e, ShaleError::Io(_)));
    }

    #[test]
    fn transient_classification() {
        assert!(ShaleError::BufferFull.is_transient());
        assert!(!ShaleError::internal("x").is_transient());
    }
}
