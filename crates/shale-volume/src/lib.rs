//! Volume layer: the page file, the store-node cache, and the
//! page-allocation cache.
//!
//! A volume is one file of fixed-size pages. Page 0 is extent 0's
//! allocation bitmap page and page 1 ([`shale_types::STNODE_PID`]) is the
//! store-node page holding per-store roots and last extents. Everything
//! else is handed out by the allocation cache, one extent at a time per
//! store.

pub mod alloc;
pub mod stnode;
pub mod volume;

pub use alloc::AllocCache;
pub use stnode::StnodeCache;
pub use volume::Volume;
