//! Page-oriented buffer pool.
//!
//! A fixed array of frames, one control block per frame, a pid→frame hash
//! under a reader-writer lock, and a free list threaded through the
//! control-block array. Callers get latched [`PageGuard`]s from
//! [`BufferPool::fix`]; the guard's drop unfixes (unlatch + unpin).
//!
//! Two background protocols keep frames flowing: the evictioner pops
//! unpinned frames back onto the free list (waking blocked grabbers), and
//! the page cleaner writes dirty frames back under the WAL rule.

pub mod cleaner;
pub mod evict;
pub mod pool;

pub use cleaner::{CleanerConfig, PageCleaner};
pub use evict::Evictioner;
pub use pool::{BufPoolConfig, BufferPool, LatchMode, PageGuard};
