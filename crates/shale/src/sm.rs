//! The storage manager: one object owning volume, log, buffer pool,
//! allocation cache, lock manager, and background workers, threaded
//! explicitly through every operation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use shale_btree::cursor::BtCursor;
use shale_btree::tree::{self, BtreeContext};
use shale_bufpool::{
    BufPoolConfig, BufferPool, CleanerConfig, Evictioner, PageCleaner,
};
use shale_error::{Result, ShaleError};
use shale_lock::{LockManager, LockManagerConfig};
use shale_types::{Lsn, PageId, StoreId};
use shale_volume::{AllocCache, StnodeCache, Volume};
use shale_wal::{LogConfig, LogManager, LogPayload, LogRecord};
use tracing::{debug, info};

use crate::recovery::{self, Recovery};
use crate::txn::{Txn, TxnTable};

/// Aggregated configuration for a storage manager instance.
#[derive(Debug, Clone, Default)]
pub struct ShaleOptions {
    pub log: LogConfig,
    pub bufpool: BufPoolConfig,
    pub cleaner: CleanerConfig,
    pub locks: LockManagerConfig,
}

fn volume_path(dir: &Path) -> PathBuf {
    dir.join("volume.shale")
}

fn log_dir(dir: &Path) -> PathBuf {
    dir.join("log")
}

/// The storage manager.
pub struct StorageManager {
    dir: PathBuf,
    volume: Arc<Volume>,
    log: Arc<LogManager>,
    stnode: Arc<StnodeCache>,
    ctx: BtreeContext,
    cleaner: Arc<PageCleaner>,
    evictioner: Mutex<Option<Evictioner>>,
    txns: TxnTable,
    /// Serializes store creation (reserve → allocate root → publish).
    create_store_gate: Mutex<()>,
}

impl StorageManager {
    /// Initialize a fresh volume at `dir` (creating the directory).
    /// Destroys nothing: formatting an existing volume is refused.
    pub fn format(dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        if volume_path(dir).exists() {
            return Err(ShaleError::Conflict {
                store: 0,
                detail: format!("volume already exists at {}", dir.display()),
            });
        }
        let volume = Volume::create(volume_path(dir))?;
        StnodeCache::format(&volume)?;
        info!(dir = %dir.display(), "formatted volume");
        Ok(())
    }

    /// Open a volume, running restart recovery over the retained log,
    /// then checkpointing so the on-disk state is self-contained.
    pub fn open(dir: impl AsRef<Path>, opts: ShaleOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let volume = Arc::new(Volume::open(volume_path(&dir))?);
        let log = LogManager::open(log_dir(&dir), opts.log.clone())?;
        let stnode = Arc::new(StnodeCache::new(&volume, Arc::clone(&log))?);
        let alloc = Arc::new(AllocCache::new(
            Arc::clone(&volume),
            Arc::clone(&stnode),
            Arc::clone(&log),
            false,
        )?);
        let pool = BufferPool::new(
            opts.bufpool.clone(),
            Arc::clone(&volume),
            Arc::clone(&log),
        );
        let locks = Arc::new(LockManager::new(opts.locks.clone()));
        let ctx = BtreeContext {
            pool: Arc::clone(&pool),
            log: Arc::clone(&log),
            alloc: Arc::clone(&alloc),
            locks: Arc::clone(&locks),
        };

        let stats = Recovery {
            ctx: &ctx,
            stnode: &stnode,
        }
        .run()?;
        recovery::assert_lock_table_empty(&locks);

        // Truncation pins. Weak references keep the log (which owns the
        // tracker) from holding its own users alive.
        {
            let weak_pool = Arc::downgrade(&pool);
            log.tracker().register("bufpool-dirty", move || {
                weak_pool.upgrade().map_or(Lsn::NULL, |p| p.min_rec_lsn())
            });
            let weak_alloc = Arc::downgrade(&alloc);
            log.tracker().register("alloc-bitmaps", move || {
                weak_alloc.upgrade().map_or(Lsn::NULL, |a| a.min_rec_lsn())
            });
            let weak_stnode = Arc::downgrade(&stnode);
            log.tracker().register("stnode", move || {
                weak_stnode.upgrade().map_or(Lsn::NULL, |s| s.rec_lsn())
            });
        }

        let cleaner = PageCleaner::new(Arc::clone(&pool), opts.cleaner.clone());
        cleaner.spawn_worker();
        let evictioner = Evictioner::spawn(Arc::clone(&pool));

        let sm = Self {
            dir,
            volume,
            log,
            stnode,
            ctx,
            cleaner,
            evictioner: Mutex::new(Some(evictioner)),
            txns: TxnTable::new(stats.max_txn_id + 1),
            create_store_gate: Mutex::new(()),
        };
        sm.checkpoint_now()?;
        info!(dir = %sm.dir.display(), "storage manager open");
        Ok(sm)
    }

    /// Create a new store with an empty B-tree; returns its id.
    pub fn create_store(&self) -> Result<StoreId> {
        let _gate = self.create_store_gate.lock();
        let store = self.stnode.reserve_store()?;
        let root = tree::create_tree(&self.ctx, store)?;
        self.stnode.set_store_root(store, root)?;
        Ok(store)
    }

    fn root_of(&self, store: StoreId) -> Result<PageId> {
        self.stnode
            .get_root(store)
            .ok_or(ShaleError::NoSuchStore { store })
    }

    /// Begin a transaction.
    #[must_use]
    pub fn begin(&self) -> Txn {
        self.txns.begin()
    }

    /// Commit: the commit record must be durable before return (group
    /// commit). Read-only transactions skip the log entirely.
    pub fn commit(&self, txn: Txn) -> Result<()> {
        if !txn.ctx.last_lsn.is_null() {
            let commit_lsn = self.log.insert(&LogRecord {
                txn: txn.ctx.id,
                prev_lsn: txn.ctx.last_lsn,
                store: 0,
                pid: 0,
                pid2: 0,
                payload: LogPayload::TxnCommit,
            })?;
            self.log.flush(commit_lsn)?;
            self.log.insert(&LogRecord {
                txn: txn.ctx.id,
                prev_lsn: commit_lsn,
                store: 0,
                pid: 0,
                pid2: 0,
                payload: LogPayload::TxnEnd,
            })?;
        }
        self.ctx.locks.release_all(txn.ctx.id);
        self.txns.end(txn.ctx.id);
        debug!(txn = %txn.ctx.id, "committed");
        Ok(())
    }

    /// Abort: logically roll back through the record chain, then release
    /// locks.
    pub fn abort(&self, txn: Txn) -> Result<()> {
        if !txn.ctx.last_lsn.is_null() {
            recovery::rollback_chain(&self.ctx, &self.stnode, txn.ctx.last_lsn)?;
            let abort_lsn = self.log.insert(&LogRecord {
                txn: txn.ctx.id,
                prev_lsn: txn.ctx.last_lsn,
                store: 0,
                pid: 0,
                pid2: 0,
                payload: LogPayload::TxnAbort,
            })?;
            self.log.insert(&LogRecord {
                txn: txn.ctx.id,
                prev_lsn: abort_lsn,
                store: 0,
                pid: 0,
                pid2: 0,
                payload: LogPayload::TxnEnd,
            })?;
        }
        self.ctx.locks.release_all(txn.ctx.id);
        self.txns.end(txn.ctx.id);
        debug!(txn = %txn.ctx.id, "aborted");
        Ok(())
    }

    pub fn insert(&self, txn: &mut Txn, store: StoreId, key: &[u8], value: &[u8]) -> Result<()> {
        let root = self.root_of(store)?;
        tree::insert(&self.ctx, &mut txn.ctx, store, root, key, value)?;
        self.txns.note_first(txn);
        Ok(())
    }

    pub fn update(&self, txn: &mut Txn, store: StoreId, key: &[u8], value: &[u8]) -> Result<()> {
        let root = self.root_of(store)?;
        tree::update(&self.ctx, &mut txn.ctx, store, root, key, value)?;
        self.txns.note_first(txn);
        Ok(())
    }

    pub fn overwrite(
        &self,
        txn: &mut Txn,
        store: StoreId,
        key: &[u8],
        offset: u16,
        bytes: &[u8],
    ) -> Result<()> {
        let root = self.root_of(store)?;
        tree::overwrite(&self.ctx, &mut txn.ctx, store, root, key, offset, bytes)?;
        self.txns.note_first(txn);
        Ok(())
    }

    pub fn remove(&self, txn: &mut Txn, store: StoreId, key: &[u8]) -> Result<()> {
        let root = self.root_of(store)?;
        tree::remove(&self.ctx, &mut txn.ctx, store, root, key)?;
        self.txns.note_first(txn);
        Ok(())
    }

    pub fn lookup(&self, txn: &Txn, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let root = self.root_of(store)?;
        tree::lookup(&self.ctx, &txn.ctx, store, root, key)
    }

    /// Open a range cursor. Bounds are `(key, inclusive)`; a missing
    /// upper bound scans to the end of the store.
    pub fn cursor(
        &self,
        txn: &Txn,
        store: StoreId,
        lower: (Vec<u8>, bool),
        upper: Option<(Vec<u8>, bool)>,
        forward: bool,
    ) -> Result<BtCursor<'_>> {
        let root = self.root_of(store)?;
        let (lower, lower_inc) = lower;
        let (upper, upper_inc) = match upper {
            Some((u, inc)) => (Some(u), inc),
            None => (None, true),
        };
        Ok(BtCursor::new(
            &self.ctx, &txn.ctx, store, root, lower, lower_inc, upper, upper_inc, forward,
        ))
    }

    /// Scan the whole store in key order.
    pub fn scan_all(&self, txn: &Txn, store: StoreId) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let root = self.root_of(store)?;
        let mut cursor = BtCursor::full(&self.ctx, &txn.ctx, store, root, true);
        let mut out = Vec::new();
        while cursor.next()? {
            out.push((cursor.key().to_vec(), cursor.value().to_vec()));
        }
        Ok(out)
    }

    /// Force a ghost-reclaim sweep over a store (maintenance hook).
    pub fn reclaim_ghosts(&self, store: StoreId) -> Result<()> {
        let root = self.root_of(store)?;
        tree::reclaim_all_ghosts(&self.ctx, store, root)
    }

    /// Verify the B-tree invariants of a store (test support).
    pub fn verify_store(&self, store: StoreId) -> Result<shale_btree::verify::TreeStats> {
        let root = self.root_of(store)?;
        shale_btree::verify::check(&self.ctx, root)
    }

    /// Checkpoint: clean every dirty frame, harden the allocation
    /// bitmaps and the store-node page, then truncate the log behind the
    /// oldest-active LSN.
    pub fn checkpoint_now(&self) -> Result<()> {
        let clean_lsn = self.cleaner.clean_pass()?;
        self.ctx.alloc.write_dirty_bitmap_pages(clean_lsn)?;
        self.stnode.write_page(&self.volume)?;
        self.volume.sync()?;

        // Active transactions pin truncation alongside the registered
        // component providers.
        let txn_pin = self.txns.min_first_lsn();
        let removed = if txn_pin.is_null() {
            self.log.truncate()?
        } else {
            let component_pin = self.log.tracker().oldest_active();
            if component_pin.is_null() || txn_pin < component_pin {
                // Cheapest correct answer: skip truncation while the
                // oldest pin belongs to a live transaction.
                Vec::new()
            } else {
                self.log.truncate()?
            }
        };
        debug!(?removed, "checkpoint complete");
        Ok(())
    }

    /// Clean shutdown: checkpoint, stop workers, close the log.
    /// Exit state: reopening performs an (empty) recovery.
    pub fn shutdown(self) -> Result<()> {
        if self.txns.active_count() > 0 {
            return Err(ShaleError::internal(
                "shutdown with active transactions",
            ));
        }
        self.checkpoint_now()?;
        self.stop_workers();
        self.log.shutdown()?;
        info!("clean shutdown");
        Ok(())
    }

    /// Test hook: drop everything volatile without cleaning a single
    /// page, as a crash would. The durable log tail survives; dirty
    /// frames, the allocation cache, and the lock table do not.
    pub fn simulate_crash(self) -> Result<()> {
        self.stop_workers();
        self.log.shutdown()?;
        info!("simulated crash");
        Ok(())
    }

    fn stop_workers(&self) {
        self.cleaner.shutdown_worker();
        if let Some(evictioner) = self.evictioner.lock().take() {
            evictioner.shutdown(&self.ctx.pool);
        }
    }

    /// Current durable LSN (test support).
    #[must_use]
    pub fn durable_lsn(&self) -> Lsn {
        self.log.durable_lsn()
    }

    /// Direct access to the allocation cache (maintenance and tests).
    #[must_use]
    pub fn alloc_cache(&self) -> &AllocCache {
        &self.ctx.alloc
    }
}
