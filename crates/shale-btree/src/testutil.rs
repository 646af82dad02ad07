//! Shared fixture for tree and cursor tests: a full stack (volume, log,
//! allocation cache, lock manager, buffer pool) over a tempdir.

use std::sync::Arc;

use shale_bufpool::{BufPoolConfig, BufferPool};
use shale_lock::{LockManager, LockManagerConfig};
use shale_types::{PageId, StoreId};
use shale_volume::{AllocCache, StnodeCache, Volume};
use shale_wal::{LogConfig, LogManager};
use tempfile::TempDir;

use crate::tree::{self, BtreeContext, TxnCtx};

pub struct TestEnv {
    pub _dir: TempDir,
    pub ctx: BtreeContext,
    pub stnode: Arc<StnodeCache>,
    pub store: StoreId,
    pub root: PageId,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let volume = Arc::new(Volume::create(dir.path().join("vol")).unwrap());
        let log = LogManager::open(dir.path().join("log"), LogConfig::default()).unwrap();
        StnodeCache::format(&volume).unwrap();
        let stnode = Arc::new(StnodeCache::new(&volume, Arc::clone(&log)).unwrap());
        let alloc = Arc::new(
            AllocCache::new(
                Arc::clone(&volume),
                Arc::clone(&stnode),
                Arc::clone(&log),
                true,
            )
            .unwrap(),
        );
        let pool = BufferPool::new(
            BufPoolConfig::default(),
            Arc::clone(&volume),
            Arc::clone(&log),
        );
        let locks = Arc::new(LockManager::new(LockManagerConfig::default()));
        let ctx = BtreeContext {
            pool,
            log,
            alloc,
            locks,
        };
        let store = stnode.reserve_store().unwrap();
        let root = tree::create_tree(&ctx, store).unwrap();
        stnode.set_store_root(store, root).unwrap();
        Self {
            _dir: dir,
            ctx,
            stnode,
            store,
            root,
        }
    }

    pub fn txn(&self, id: u64) -> TxnCtx {
        TxnCtx::new(shale_types::TxnId(id))
    }

    /// A transaction context that skips locking (most structural tests
    /// don't care about lock traffic).
    pub fn txn_nolock(&self, id: u64) -> TxnCtx {
        let mut txn = TxnCtx::new(shale_types::TxnId(id));
        txn.needs_lock = false;
        txn
    }

    pub fn release(&self, txn: &TxnCtx) {
        self.ctx.locks.release_all(txn.id);
    }
}
