//! Shale: a disk-based transactional storage manager.
//!
//! A foster B-link tree over a page-oriented buffer pool, ARIES-style
//! write-ahead logging with group commit, a per-store page-allocation
//! cache, and OKVL key-range locking. One [`StorageManager`] owns the
//! whole stack and is the control surface:
//!
//! ```no_run
//! use shale::{ShaleOptions, StorageManager};
//!
//! let dir = std::path::Path::new("/tmp/db");
//! StorageManager::format(dir)?;
//! let sm = StorageManager::open(dir, ShaleOptions::default())?;
//! let store = sm.create_store()?;
//!
//! let mut txn = sm.begin();
//! sm.insert(&mut txn, store, b"hello", b"world")?;
//! sm.commit(txn)?;
//!
//! let txn = sm.begin();
//! assert_eq!(sm.lookup(&txn, store, b"hello")?, Some(b"world".to_vec()));
//! sm.commit(txn)?;
//! sm.shutdown()?;
//! # Ok::<(), shale::ShaleError>(())
//! ```
//!
//! Crash recovery happens inside [`StorageManager::open`]: a forward scan
//! redoes every retained log record (skipping by page LSN), then every
//! in-flight transaction is logically rolled back.

mod recovery;
mod sm;
mod txn;

pub use shale_error::{Result, ShaleError};
pub use shale_types::{Lsn, PageId, StoreId, TxnId};
pub use sm::{ShaleOptions, StorageManager};
pub use txn::Txn;

pub use shale_btree::cursor::CursorState;
pub use shale_btree::verify::TreeStats;
pub use shale_volume::AllocCache;
