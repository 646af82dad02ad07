//! Restart recovery: fused analysis + redo forward scan, then logical
//! undo of in-flight transactions.
//!
//! The scan visits every retained durable record in LSN order. Page
//! records are re-applied only when the target page's stored LSN is
//! older (the idempotent redo skip rule); allocation and store-node
//! records replay into their caches, which carry their own LSN guards.
//! Transactions that reached neither a commit nor an abort record are
//! then rolled back through their `prev_lsn` chains, newest first,
//! exactly as a live abort would.

use std::collections::HashMap;

use shale_btree::tree::{self, BtreeContext, RedoFrame};
use shale_bufpool::LatchMode;
use shale_error::{Result, ShaleError};
use shale_lock::LockManager;
use shale_types::{Lsn, PageId, StoreId, TxnId};
use shale_volume::StnodeCache;
use shale_wal::{LogPayload, LogRecord, UndoOps};
use tracing::{debug, info, warn};

/// What recovery found and fixed.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RecoveryStats {
    pub records_scanned: usize,
    pub pages_redone: usize,
    pub txns_rolled_back: usize,
    /// Highest transaction id seen; id assignment resumes above it.
    pub max_txn_id: u64,
}

pub(crate) struct Recovery<'a> {
    pub ctx: &'a BtreeContext,
    pub stnode: &'a StnodeCache,
}

impl Recovery<'_> {
    pub(crate) fn run(&self) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        // Active = regular records seen, no commit/abort yet. Maps to the
        // transaction's most recent record for chain walking.
        let mut active: HashMap<u64, Lsn> = HashMap::new();

        let mut scan = self.ctx.log.scan_from_start()?;
        while let Some((lsn, rec)) = scan.next_record()? {
            stats.records_scanned += 1;
            stats.max_txn_id = stats.max_txn_id.max(rec.txn.0);
            self.replay(&mut active, lsn, &rec, &mut stats)?;
        }

        // Roll back in-flight transactions, newest chain head first.
        let mut leftovers: Vec<(u64, Lsn)> = active.into_iter().collect();
        leftovers.sort_by_key(|&(_, lsn)| std::cmp::Reverse(lsn));
        for (txn_id, last_lsn) in leftovers {
            info!(txn = txn_id, %last_lsn, "rolling back in-flight transaction");
            rollback_chain(self.ctx, self.stnode, last_lsn)?;
            let rec = LogRecord {
                txn: TxnId(txn_id),
                prev_lsn: last_lsn,
                store: 0,
                pid: 0,
                pid2: 0,
                payload: LogPayload::TxnAbort,
            };
            let abort_lsn = self.ctx.log.insert(&rec)?;
            self.ctx.log.insert(&LogRecord {
                txn: TxnId(txn_id),
                prev_lsn: abort_lsn,
                store: 0,
                pid: 0,
                pid2: 0,
                payload: LogPayload::TxnEnd,
            })?;
            stats.txns_rolled_back += 1;
        }
        self.ctx.log.flush_all()?;

        info!(
            records = stats.records_scanned,
            redone = stats.pages_redone,
            rolled_back = stats.txns_rolled_back,
            "recovery complete"
        );
        Ok(stats)
    }

    fn replay(
        &self,
        active: &mut HashMap<u64, Lsn>,
        lsn: Lsn,
        rec: &LogRecord,
        stats: &mut RecoveryStats,
    ) -> Result<()> {
        // Analysis half: track the undo chains of live transactions.
        // SSX records (including logical-undo actions) never join one.
        if !rec.txn.is_none() && !rec.payload.is_ssx() {
            match rec.payload {
                LogPayload::TxnCommit | LogPayload::TxnAbort | LogPayload::TxnEnd => {
                    active.remove(&rec.txn.0);
                }
                _ => {
                    active.insert(rec.txn.0, lsn);
                }
            }
        }

        // Redo half.
        match &rec.payload {
            LogPayload::AllocPage => {
                self.ctx.alloc.redo_allocate(rec.pid, rec.store, lsn);
            }
            LogPayload::DeallocPage => {
                self.ctx.alloc.redo_deallocate(rec.pid, lsn);
            }
            LogPayload::StoreCreate { root_pid } => {
                self.stnode.redo_store_create(rec.store, *root_pid, lsn);
            }
            LogPayload::StoreExtent { extent } => {
                self.stnode.redo_append_extent(rec.store, *extent, lsn);
            }
            LogPayload::PageWrite { .. }
            | LogPayload::PageEvict { .. }
            | LogPayload::TxnCommit
            | LogPayload::TxnAbort
            | LogPayload::TxnEnd => {}
            _ => {
                if self.redo_page(lsn, rec, rec.pid)? {
                    stats.pages_redone += 1;
                }
                if rec.pid2 != 0 && self.redo_page(lsn, rec, rec.pid2)? {
                    stats.pages_redone += 1;
                }
            }
        }
        Ok(())
    }

    /// Apply one record against one page iff the page is behind it.
    /// Recovery opts out of eviction so a wedged pool surfaces as
    /// `BufferFull` instead of deadlocking against itself.
    fn redo_page(&self, lsn: Lsn, rec: &LogRecord, pid: PageId) -> Result<bool> {
        let mut guard = self.ctx.pool.fix(pid, LatchMode::Ex, false)?;
        if guard.lsn() >= lsn {
            return Ok(false);
        }
        let mut frame = RedoFrame::new(pid, guard.page_mut().as_bytes_mut());
        rec.apply_redo(&mut frame)?;
        guard.set_lsn(lsn);
        debug!(pid, %lsn, kind = ?rec.kind(), "redo applied");
        Ok(true)
    }
}

/// Walk a transaction's `prev_lsn` chain backwards, applying logical
/// undo for each record. Shared by live abort and restart rollback.
pub(crate) fn rollback_chain(
    ctx: &BtreeContext,
    stnode: &StnodeCache,
    last_lsn: Lsn,
) -> Result<()> {
    let mut undo = UndoDriver { ctx, stnode };
    let mut cur = last_lsn;
    while !cur.is_null() {
        let (rec, prev) = ctx.log.fetch_direct(cur)?;
        rec.apply_undo(&mut undo)?;
        cur = prev;
    }
    Ok(())
}

/// Adapts the log crate's logical-undo capability onto the tree.
/// Re-traverses from each store's root; takes no user locks (the
/// aborting transaction already holds them).
struct UndoDriver<'a> {
    ctx: &'a BtreeContext,
    stnode: &'a StnodeCache,
}

impl UndoDriver<'_> {
    fn root_of(&self, store: StoreId) -> Result<PageId> {
        self.stnode.get_root(store).ok_or_else(|| {
            warn!(store, "undo against a store with no root");
            ShaleError::internal("undo against unknown store")
        })
    }
}

impl UndoOps for UndoDriver<'_> {
    fn remove_as_undo(&mut self, store: StoreId, key: &[u8]) -> Result<()> {
        let root = self.root_of(store)?;
        tree::remove_as_undo(self.ctx, store, root, key)
    }

    fn update_as_undo(&mut self, store: StoreId, key: &[u8], old: &[u8]) -> Result<()> {
        let root = self.root_of(store)?;
        tree::update_as_undo(self.ctx, store, root, key, old)
    }

    fn overwrite_as_undo(
        &mut self,
        store: StoreId,
        key: &[u8],
        old: &[u8],
        offset: u16,
    ) -> Result<()> {
        let root = self.root_of(store)?;
        tree::overwrite_as_undo(self.ctx, store, root, key, old, offset)
    }

    fn undo_ghost_mark(&mut self, store: StoreId, key: &[u8]) -> Result<()> {
        let root = self.root_of(store)?;
        tree::undo_ghost_mark(self.ctx, store, root, key)
    }
}

/// Release any locks the lock manager believes are held once recovery is
/// done (there are none in a correct run; this is belt-and-braces for
/// the wait-die ids recycled after restart).
pub(crate) fn assert_lock_table_empty(locks: &LockManager) {
    if !locks.is_empty() {
        warn!("lock table not empty after recovery");
    }
}
