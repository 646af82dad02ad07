//! Transaction handles and the active-transaction table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use shale_btree::TxnCtx;
use shale_types::{Lsn, TxnId};

/// A user transaction handle. Obtained from `StorageManager::begin` and
/// consumed by `commit`/`abort`.
pub struct Txn {
    pub(crate) ctx: TxnCtx,
    /// LSN of this transaction's first log record; pins truncation.
    pub(crate) first_lsn: Lsn,
}

impl Txn {
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.ctx.id
    }

    /// Request exclusive read locks for the rest of this transaction
    /// (select-for-update semantics).
    pub fn set_ex_lock(&mut self, ex: bool) {
        self.ctx.ex_lock = ex;
    }
}

/// Identifier assignment plus the first-LSN table feeding the oldest-LSN
/// tracker.
pub(crate) struct TxnTable {
    next: AtomicU64,
    active: Mutex<HashMap<u64, Lsn>>,
}

impl TxnTable {
    pub(crate) fn new(first_free_id: u64) -> Self {
        Self {
            next: AtomicU64::new(first_free_id.max(1)),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn begin(&self) -> Txn {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        Txn {
            ctx: TxnCtx::new(TxnId(id)),
            first_lsn: Lsn::NULL,
        }
    }

    /// Record the first log record of a transaction.
    pub(crate) fn note_first(&self, txn: &mut Txn) {
        if txn.first_lsn.is_null() && !txn.ctx.last_lsn.is_null() {
            txn.first_lsn = txn.ctx.last_lsn;
            self.active.lock().insert(txn.ctx.id.0, txn.first_lsn);
        }
    }

    pub(crate) fn end(&self, id: TxnId) {
        self.active.lock().remove(&id.0);
    }

    /// Oldest first-LSN over active transactions, or null.
    pub(crate) fn min_first_lsn(&self) -> Lsn {
        self.active
            .lock()
            .values()
            .copied()
            .min()
            .unwrap_or(Lsn::NULL)
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}
