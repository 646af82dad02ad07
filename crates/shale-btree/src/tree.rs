//! Latched tree operations: traversal, user operations, structural
//! modifications (SSXs), logical undo, and the redo adapter.
//!
//! Every structural change follows the same shape: check that the change
//! cannot fail for lack of space, insert the SSX log record, apply the
//! page mutation(s), stamp the page LSN(s). User operations additionally
//! chain their records through the transaction's `prev_lsn` and take key
//! locks under the latch, retrying through the lock manager's `Retry`
//! outcome (unfix, blocking acquire, re-traverse).

use std::sync::Arc;

use shale_bufpool::{BufferPool, LatchMode, PageGuard};
use shale_error::{Result, ShaleError};
use shale_lock::{IntentMode, LockManager, LockMode, LockOutcome};
use shale_types::{Lsn, PageBuf, PageId, StoreId, TxnId};
use shale_volume::AllocCache;
use shale_wal::{LogManager, LogPayload, LogRecord, RedoPage};
use tracing::{debug, trace};

use crate::page::{self, Foster, FormatSpec, MAX_RECORD_SIZE};

/// Everything a B-tree operation needs, threaded explicitly.
pub struct BtreeContext {
    pub pool: Arc<BufferPool>,
    pub log: Arc<LogManager>,
    pub alloc: Arc<AllocCache>,
    pub locks: Arc<LockManager>,
}

/// Per-transaction state a B-tree operation mutates: the log chain head
/// and the locking profile.
#[derive(Debug, Clone)]
pub struct TxnCtx {
    pub id: TxnId,
    pub last_lsn: Lsn,
    pub needs_lock: bool,
    /// Take exclusive read locks (select-for-update semantics).
    pub ex_lock: bool,
}

impl TxnCtx {
    #[must_use]
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            last_lsn: Lsn::NULL,
            needs_lock: true,
            ex_lock: false,
        }
    }

    /// A context that neither locks nor belongs to a live transaction
    /// (recovery and logical undo).
    #[must_use]
    pub fn system() -> Self {
        Self {
            id: TxnId::NONE,
            last_lsn: Lsn::NULL,
            needs_lock: false,
            ex_lock: false,
        }
    }
}

/// Traversal target selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverseMode {
    /// Descend to the page whose `[fence_low, fence_high)` contains the
    /// key.
    FenceContain,
    /// Cross to the page whose low fence equals the key (forward cursor
    /// crossing). Falls back to containment when no exact match exists.
    FenceLowMatch,
    /// Mirror image for backward scans: the page whose high fence equals
    /// the key.
    FenceHighMatch,
}

/// A traversal key, with an explicit supremum for backward scans that
/// start above every key.
#[derive(Debug, Clone, Copy)]
pub enum SearchBound<'a> {
    Key(&'a [u8]),
    Supremum,
}

fn beyond_high(bytes: &[u8], bound: SearchBound<'_>, high_match: bool) -> bool {
    let Some(high) = page::fence_high(bytes) else {
        return false;
    };
    match bound {
        SearchBound::Supremum => true,
        SearchBound::Key(key) => {
            if high_match {
                key > high
            } else {
                key >= high
            }
        }
    }
}

fn child_for_bound(bytes: &[u8], bound: SearchBound<'_>, high_match: bool) -> (PageId, Lsn) {
    match bound {
        SearchBound::Key(key) => page::child_for(bytes, key, high_match),
        SearchBound::Supremum => {
            let n = page::nrecs(bytes);
            if n > 0 {
                page::slot_child(bytes, n - 1)
            } else {
                page::pid0(bytes)
                    .unwrap_or_else(|| unreachable!("interior page without pid0"))
            }
        }
    }
}

/// Latch-coupled descent from the root, following foster pointers within
/// each level. Interior pages are latched shared; the leaf gets
/// `leaf_mode`.
pub fn traverse<'p>(
    ctx: &'p BtreeContext,
    root: PageId,
    bound: SearchBound<'_>,
    mode: TraverseMode,
    leaf_mode: LatchMode,
) -> Result<PageGuard<'p>> {
    let high_match = mode == TraverseMode::FenceHighMatch;
    'restart: loop {
        let mut cur = ctx.pool.fix(root, LatchMode::Sh, true)?;
        if page::is_leaf(cur.page().as_bytes()) && leaf_mode == LatchMode::Ex {
            drop(cur);
            cur = ctx.pool.fix(root, LatchMode::Ex, true)?;
        }
        loop {
            let bytes = cur.page().as_bytes();
            if beyond_high(bytes, bound, high_match) {
                match page::foster(bytes) {
                    Some(f) => {
                        let next = ctx.pool.fix(f.pid, cur.mode(), true)?;
                        cur = next;
                        continue;
                    }
                    None => {
                        // The chain should cover the bound; a mismatch
                        // means the page moved under us. Start over.
                        drop(cur);
                        continue 'restart;
                    }
                }
            }
            if page::is_leaf(bytes) {
                return Ok(cur);
            }
            let (child, _emlsn) = child_for_bound(bytes, bound, high_match);
            let child_mode = if page::level(bytes) == 1 {
                leaf_mode
            } else {
                LatchMode::Sh
            };
            let next = ctx.pool.fix(child, child_mode, true)?;
            cur = next;
        }
    }
}

fn log_ssx(
    ctx: &BtreeContext,
    store: StoreId,
    pid: PageId,
    pid2: PageId,
    payload: LogPayload,
) -> Result<Lsn> {
    ctx.log.insert(&LogRecord {
        txn: TxnId::NONE,
        prev_lsn: Lsn::NULL,
        store,
        pid,
        pid2,
        payload,
    })
}

fn log_user(
    ctx: &BtreeContext,
    txn: &mut TxnCtx,
    store: StoreId,
    pid: PageId,
    payload: LogPayload,
) -> Result<Lsn> {
    let lsn = ctx.log.insert(&LogRecord {
        txn: txn.id,
        prev_lsn: txn.last_lsn,
        store,
        pid,
        pid2: 0,
        payload,
    })?;
    if !txn.id.is_none() {
        txn.last_lsn = lsn;
    }
    Ok(lsn)
}

/// After enough bytes of log against one page, bound its redo chain with
/// a full image record.
fn maybe_page_img(
    ctx: &BtreeContext,
    store: StoreId,
    guard: &mut PageGuard<'_>,
    rec_size: usize,
) -> Result<()> {
    if ctx.log.note_page_update(guard.pid(), rec_size) {
        let image = guard.page().as_bytes().to_vec();
        let lsn = log_ssx(ctx, store, guard.pid(), 0, LogPayload::PageImg { image })?;
        guard.set_lsn(lsn);
        trace!(pid = guard.pid(), "page image logged");
    }
    Ok(())
}

/// Fence codec for log payloads: an empty byte string stands for the
/// infimum (low) / supremum (high). Real fence keys are never empty
/// (an empty high fence would be an empty key range).
fn enc_fence(f: Option<&[u8]>) -> Vec<u8> {
    f.map_or_else(Vec::new, <[u8]>::to_vec)
}

fn dec_fence(v: &[u8]) -> Option<&[u8]> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

/// Create a fresh single-leaf tree for `store`; returns the root pid.
/// The root is allocated and formatted by one norec-alloc SSX with no
/// parent half.
pub fn create_tree(ctx: &BtreeContext, store: StoreId) -> Result<PageId> {
    let root = ctx.alloc.allocate(store)?;
    let lsn = log_ssx(
        ctx,
        store,
        root,
        0,
        LogPayload::BtreeNorecAlloc {
            level: 0,
            fence_low: Vec::new(),
            fence_high: Vec::new(),
            chain_high: Vec::new(),
        },
    )?;
    let mut guard = ctx.pool.fix_virgin(root, true)?;
    page::format(
        guard.page_mut().as_bytes_mut(),
        &FormatSpec {
            pid: root,
            store,
            level: 0,
            fence_low: &[],
            fence_high: None,
            chain_high: None,
            foster: None,
            pid0: None,
        },
    );
    guard.set_lsn(lsn);
    debug!(store, root, "created tree");
    Ok(root)
}

/// Insert `key -> value`.
///
/// Two-step discipline: a ghost-reserve SSX creates (or widens) a ghost
/// slot, then the user record fills it — which is what makes insert REDO
/// a plain ghost replacement.
pub fn insert(
    ctx: &BtreeContext,
    txn: &mut TxnCtx,
    store: StoreId,
    root: PageId,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    if page::space_for(key.len(), value.len()) > MAX_RECORD_SIZE {
        return Err(ShaleError::RecordTooLarge {
            size: key.len() + value.len(),
        });
    }
    if txn.needs_lock {
        ctx.locks.intent_store_lock(txn.id, store, IntentMode::IX);
    }
    loop {
        let mut leaf = traverse(ctx, root, SearchBound::Key(key), TraverseMode::FenceContain, LatchMode::Ex)?;
        if txn.needs_lock {
            match ctx.locks.acquire(txn.id, store, key, LockMode::XN, true)? {
                LockOutcome::Granted => {}
                LockOutcome::Retry => {
                    drop(leaf);
                    ctx.locks.acquire(txn.id, store, key, LockMode::XN, false)?;
                    continue;
                }
            }
        }

        let bytes = leaf.page().as_bytes();
        let (found, slot) = page::search(bytes, key);
        if found && !page::is_ghost(bytes, slot) {
            return Err(ShaleError::Conflict {
                store,
                detail: format!("duplicate key ({} bytes)", key.len()),
            });
        }

        // Make sure the ghost step cannot fail for space.
        let needed = if found {
            let capacity = page::record_capacity(bytes, slot);
            if capacity >= value.len() {
                0
            } else {
                4 + key.len() + value.len()
            }
        } else {
            page::space_for(key.len(), value.len())
        };
        if needed > page::free_space(bytes) {
            if reclaim_or_split(ctx, store, &mut leaf)? {
                drop(leaf);
                adopt_path(ctx, store, root, key)?;
            }
            continue;
        }

        if needed > 0 || !found {
            let lsn = log_ssx(
                ctx,
                store,
                leaf.pid(),
                0,
                LogPayload::BtreeGhostReserve {
                    key: key.to_vec(),
                    value_len: value.len() as u16,
                },
            )?;
            page::reserve_ghost(leaf.page_mut().as_bytes_mut(), key, value.len())?;
            leaf.set_lsn(lsn);
        }

        let rec_size = key.len() + value.len() + 32;
        let lsn = log_user(
            ctx,
            txn,
            store,
            leaf.pid(),
            LogPayload::BtreeInsert {
                key: key.to_vec(),
                value: value.to_vec(),
            },
        )?;
        page::replace_ghost(leaf.page_mut().as_bytes_mut(), key, value)?;
        leaf.set_lsn(lsn);
        maybe_page_img(ctx, store, &mut leaf, rec_size)?;
        return Ok(());
    }
}

/// Free space on a full page: reclaim committed ghosts if possible,
/// otherwise split. Returns true when a split happened (the caller
/// should give adoption a chance).
fn reclaim_or_split(
    ctx: &BtreeContext,
    store: StoreId,
    leaf: &mut PageGuard<'_>,
) -> Result<bool> {
    let bytes = leaf.page().as_bytes();
    let ghosts: Vec<Vec<u8>> = (0..page::nrecs(bytes))
        .filter(|&i| page::is_ghost(bytes, i))
        .map(|i| page::slot_key(bytes, i).to_vec())
        .collect();
    let reclaimable =
        !ghosts.is_empty() && ghosts.iter().all(|k| !ctx.locks.is_locked(store, k));
    if reclaimable {
        sx_reclaim_ghosts(ctx, store, leaf, ghosts)?;
        Ok(false)
    } else {
        sx_split(ctx, store, leaf)?;
        Ok(true)
    }
}

/// Ghost-reclaim SSX: defragment the page, physically removing every
/// ghost. No undo.
pub fn sx_reclaim_ghosts(
    ctx: &BtreeContext,
    store: StoreId,
    guard: &mut PageGuard<'_>,
    keys: Vec<Vec<u8>>,
) -> Result<()> {
    let lsn = log_ssx(
        ctx,
        store,
        guard.pid(),
        0,
        LogPayload::BtreeGhostReclaim { keys },
    )?;
    page::reclaim_ghosts(guard.page_mut().as_bytes_mut())?;
    guard.set_lsn(lsn);
    trace!(pid = guard.pid(), "ghosts reclaimed");
    Ok(())
}

/// Split SSX: move the top half of `guard` into a new foster child.
/// Works for leaves and interior pages alike.
pub fn sx_split(ctx: &BtreeContext, store: StoreId, guard: &mut PageGuard<'_>) -> Result<()> {
    let bytes = guard.page().as_bytes();
    let n = page::nrecs(bytes);
    if n < 2 {
        return Err(ShaleError::OutOfSpace {
            detail: "page too full to split".into(),
        });
    }
    let split_slot = n / 2;
    let move_count = n - split_slot;
    let separator = page::slot_key(bytes, split_slot).to_vec();
    let interior = !page::is_leaf(bytes);

    let old_high = page::fence_high(bytes).map(<[u8]>::to_vec);
    let old_chain = page::chain_high(bytes).map(<[u8]>::to_vec);
    let old_foster = page::foster(bytes);
    let new_chain = if old_foster.is_some() {
        old_chain
    } else {
        old_high.clone()
    };

    let new_pid = ctx.alloc.allocate(store)?;

    // Build the child image: it inherits the upper range and any
    // existing foster link (the new child slots into the chain).
    let mut child = PageBuf::zeroed();
    {
        let cbytes = child.as_bytes_mut();
        let pid0 = if interior {
            Some(page::slot_child(bytes, split_slot))
        } else {
            None
        };
        page::format(
            cbytes,
            &FormatSpec {
                pid: new_pid,
                store,
                level: page::level(bytes),
                fence_low: &separator,
                fence_high: old_high.as_deref(),
                chain_high: if old_foster.is_some() {
                    new_chain.as_deref()
                } else {
                    None
                },
                foster: old_foster,
                pid0,
            },
        );
        let first_moved = if interior { split_slot + 1 } else { split_slot };
        for slot in first_moved..n {
            page::push_record(
                cbytes,
                page::slot_key(bytes, slot),
                page::slot_value(bytes, slot),
                page::record_capacity(bytes, slot),
                page::is_ghost(bytes, slot),
            )?;
        }
    }

    let lsn = log_ssx(
        ctx,
        store,
        new_pid,
        guard.pid(),
        LogPayload::BtreeSplit {
            move_count: move_count as u16,
            new_high_fence: separator.clone(),
            new_chain_high: enc_fence(new_chain.as_deref()),
            child_image: child.as_bytes().to_vec(),
        },
    )?;

    // Child half.
    {
        let mut cguard = ctx.pool.fix_virgin(new_pid, true)?;
        page::format_steal(cguard.page_mut().as_bytes_mut(), child.as_bytes())?;
        cguard.set_lsn(lsn);
    }
    // Parent half.
    page::delete_range(guard.page_mut().as_bytes_mut(), split_slot, n)?;
    page::set_foster_child(
        guard.page_mut().as_bytes_mut(),
        Foster {
            pid: new_pid,
            emlsn: lsn,
        },
        &separator,
        new_chain.as_deref(),
    )?;
    guard.set_lsn(lsn);
    debug!(parent = guard.pid(), child = new_pid, moved = move_count, "split");
    Ok(())
}

/// Norec-alloc SSX: hang a brand-new empty foster child off `guard` at
/// its high fence. Couples allocation and linkage in one atomic record,
/// closing the zombie-page window for tree pages.
pub fn sx_norec_alloc(
    ctx: &BtreeContext,
    store: StoreId,
    guard: &mut PageGuard<'_>,
) -> Result<PageId> {
    let bytes = guard.page().as_bytes();
    if page::foster(bytes).is_some() {
        return Err(ShaleError::internal("norec-alloc on a page with a foster child"));
    }
    let Some(high) = page::fence_high(bytes).map(<[u8]>::to_vec) else {
        return Err(ShaleError::internal("norec-alloc at the supremum edge"));
    };
    let level = page::level(bytes);
    let new_pid = ctx.alloc.allocate(store)?;
    let lsn = log_ssx(
        ctx,
        store,
        new_pid,
        guard.pid(),
        LogPayload::BtreeNorecAlloc {
            level,
            fence_low: high.clone(),
            fence_high: high.clone(),
            chain_high: high.clone(),
        },
    )?;
    {
        let mut cguard = ctx.pool.fix_virgin(new_pid, true)?;
        page::format(
            cguard.page_mut().as_bytes_mut(),
            &FormatSpec {
                pid: new_pid,
                store,
                level,
                fence_low: &high,
                fence_high: Some(&high),
                chain_high: None,
                foster: None,
                pid0: None,
            },
        );
        cguard.set_lsn(lsn);
    }
    page::set_foster_child(
        guard.page_mut().as_bytes_mut(),
        Foster {
            pid: new_pid,
            emlsn: lsn,
        },
        &high,
        Some(&high),
    )?;
    guard.set_lsn(lsn);
    Ok(new_pid)
}

/// Adopt SSX: promote `child`'s foster pointer into `parent`.
/// `parent` and `child` must both be exclusively latched; the caller
/// guarantees parent space.
pub fn sx_adopt(
    ctx: &BtreeContext,
    store: StoreId,
    parent: &mut PageGuard<'_>,
    child: &mut PageGuard<'_>,
) -> Result<()> {
    let cbytes = child.page().as_bytes();
    let Some(f) = page::foster(cbytes) else {
        return Ok(());
    };
    let separator = page::fence_high(cbytes)
        .ok_or_else(|| ShaleError::internal("foster page without a high fence"))?
        .to_vec();
    if page::free_space(parent.page().as_bytes()) < page::space_for(separator.len(), 12) {
        return Err(ShaleError::OutOfSpace {
            detail: "parent full during adoption".into(),
        });
    }
    let lsn = log_ssx(
        ctx,
        store,
        parent.pid(),
        child.pid(),
        LogPayload::BtreeFosterAdopt {
            new_child_pid: f.pid,
            new_child_emlsn: f.emlsn,
            separator: separator.clone(),
        },
    )?;
    page::insert_child(parent.page_mut().as_bytes_mut(), &separator, f.pid, f.emlsn)?;
    parent.set_lsn(lsn);
    page::clear_foster(child.page_mut().as_bytes_mut());
    child.set_lsn(lsn);
    debug!(parent = parent.pid(), child = child.pid(), adopted = f.pid, "adopt");
    Ok(())
}

/// Grow SSX: push the root's contents down into a new child, raising the
/// tree by one level. The root keeps its pid (and its place in the
/// store-node page); the caller holds it exclusively.
pub fn sx_grow_root(
    ctx: &BtreeContext,
    store: StoreId,
    root: &mut PageGuard<'_>,
) -> Result<()> {
    let bytes = root.page().as_bytes();
    let new_level = page::level(bytes) + 1;
    let fence_low = page::fence_low(bytes).to_vec();
    let fence_high = page::fence_high(bytes).map(<[u8]>::to_vec);
    let child_pid = ctx.alloc.allocate(store)?;

    let mut child = PageBuf::zeroed();
    page::format_steal(child.as_bytes_mut(), bytes)?;
    shale_types::page::write_u32(child.as_bytes_mut(), shale_types::page::off::PID, child_pid);

    let lsn = log_ssx(
        ctx,
        store,
        child_pid,
        root.pid(),
        LogPayload::BtreeGrow {
            level: new_level,
            fence_low: fence_low.clone(),
            fence_high: enc_fence(fence_high.as_deref()),
            child_image: child.as_bytes().to_vec(),
        },
    )?;
    {
        let mut cguard = ctx.pool.fix_virgin(child_pid, true)?;
        page::format_steal(cguard.page_mut().as_bytes_mut(), child.as_bytes())?;
        cguard.set_lsn(lsn);
    }
    let root_pid = root.pid();
    page::format(
        root.page_mut().as_bytes_mut(),
        &FormatSpec {
            pid: root_pid,
            store,
            level: new_level,
            fence_low: &fence_low,
            fence_high: fence_high.as_deref(),
            chain_high: None,
            foster: None,
            pid0: Some((child_pid, lsn)),
        },
    );
    root.set_lsn(lsn);
    debug!(root = root.pid(), child = child_pid, level = new_level, "grow");
    Ok(())
}

/// Walk the path toward `key`, adopting every foster child found along
/// it (growing the root first when the root itself carries one).
/// Opportunistic: latch contention or a full parent simply ends the
/// sweep — the fosters stay correct until next time.
pub fn adopt_path(ctx: &BtreeContext, store: StoreId, root: PageId, key: &[u8]) -> Result<()> {
    'restart: loop {
        let mut parent = ctx.pool.fix(root, LatchMode::Ex, true)?;
        if page::foster(parent.page().as_bytes()).is_some() {
            sx_grow_root(ctx, store, &mut parent)?;
        }
        loop {
            if page::is_leaf(parent.page().as_bytes()) {
                return Ok(());
            }
            let (child_pid, _) = page::child_for(parent.page().as_bytes(), key, false);
            let mut child = ctx.pool.fix(child_pid, LatchMode::Ex, true)?;
            if page::foster(child.page().as_bytes()).is_some() {
                match sx_adopt(ctx, store, &mut parent, &mut child) {
                    Ok(()) => {
                        // Re-route: the key may now belong to the
                        // adopted sibling.
                        drop(child);
                        continue;
                    }
                    Err(ShaleError::OutOfSpace { .. }) => {
                        drop(child);
                        sx_split(ctx, store, &mut parent)?;
                        drop(parent);
                        continue 'restart;
                    }
                    Err(e) => return Err(e),
                }
            }
            parent = child;
        }
    }
}

/// Fence-rewrite SSX (low, high, chain-high).
pub fn sx_compress(
    ctx: &BtreeContext,
    store: StoreId,
    guard: &mut PageGuard<'_>,
    fence_low: &[u8],
    fence_high: Option<&[u8]>,
    chain_high: Option<&[u8]>,
) -> Result<()> {
    let lsn = log_ssx(
        ctx,
        store,
        guard.pid(),
        0,
        LogPayload::BtreeCompress {
            fence_low: fence_low.to_vec(),
            fence_high: enc_fence(fence_high),
            chain_high: enc_fence(chain_high),
        },
    )?;
    page::compress(guard.page_mut().as_bytes_mut(), fence_low, fence_high, chain_high)?;
    guard.set_lsn(lsn);
    Ok(())
}

/// Point lookup. Takes a shared key lock (exclusive under
/// select-for-update) and skips ghosts.
pub fn lookup(
    ctx: &BtreeContext,
    txn: &TxnCtx,
    store: StoreId,
    root: PageId,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    if txn.needs_lock {
        ctx.locks.intent_store_lock(txn.id, store, IntentMode::IS);
    }
    loop {
        let leaf = traverse(ctx, root, SearchBound::Key(key), TraverseMode::FenceContain, LatchMode::Sh)?;
        if txn.needs_lock {
            let mode = if txn.ex_lock { LockMode::XN } else { LockMode::SN };
            match ctx.locks.acquire(txn.id, store, key, mode, true)? {
                LockOutcome::Granted => {}
                LockOutcome::Retry => {
                    drop(leaf);
                    ctx.locks.acquire(txn.id, store, key, mode, false)?;
                    continue;
                }
            }
        }
        let bytes = leaf.page().as_bytes();
        let (found, slot) = page::search(bytes, key);
        if found && !page::is_ghost(bytes, slot) {
            return Ok(Some(page::slot_value(bytes, slot).to_vec()));
        }
        return Ok(None);
    }
}

/// Whole-value update. Undo restores the old image.
pub fn update(
    ctx: &BtreeContext,
    txn: &mut TxnCtx,
    store: StoreId,
    root: PageId,
    key: &[u8],
    new: &[u8],
) -> Result<()> {
    if page::space_for(key.len(), new.len()) > MAX_RECORD_SIZE {
        return Err(ShaleError::RecordTooLarge {
            size: key.len() + new.len(),
        });
    }
    if txn.needs_lock {
        ctx.locks.intent_store_lock(txn.id, store, IntentMode::IX);
    }
    loop {
        let mut leaf = traverse(ctx, root, SearchBound::Key(key), TraverseMode::FenceContain, LatchMode::Ex)?;
        if txn.needs_lock {
            match ctx.locks.acquire(txn.id, store, key, LockMode::XN, true)? {
                LockOutcome::Granted => {}
                LockOutcome::Retry => {
                    drop(leaf);
                    ctx.locks.acquire(txn.id, store, key, LockMode::XN, false)?;
                    continue;
                }
            }
        }
        let bytes = leaf.page().as_bytes();
        let (found, slot) = page::search(bytes, key);
        if !found || page::is_ghost(bytes, slot) {
            return Err(ShaleError::KeyNotFound { store });
        }
        let old = page::slot_value(bytes, slot).to_vec();
        let capacity = page::record_capacity(bytes, slot);
        if new.len() > capacity && 4 + key.len() + new.len() > page::free_space(bytes) {
            if reclaim_or_split(ctx, store, &mut leaf)? {
                drop(leaf);
                adopt_path(ctx, store, root, key)?;
            }
            continue;
        }

        let rec_size = key.len() + old.len() + new.len() + 32;
        let lsn = log_user(
            ctx,
            txn,
            store,
            leaf.pid(),
            LogPayload::BtreeUpdate {
                key: key.to_vec(),
                old,
                new: new.to_vec(),
            },
        )?;
        page::replace_value(leaf.page_mut().as_bytes_mut(), key, new)?;
        leaf.set_lsn(lsn);
        maybe_page_img(ctx, store, &mut leaf, rec_size)?;
        return Ok(());
    }
}

/// Partial-value overwrite at `offset`. Always in place.
pub fn overwrite(
    ctx: &BtreeContext,
    txn: &mut TxnCtx,
    store: StoreId,
    root: PageId,
    key: &[u8],
    offset: u16,
    bytes_new: &[u8],
) -> Result<()> {
    if txn.needs_lock {
        ctx.locks.intent_store_lock(txn.id, store, IntentMode::IX);
    }
    loop {
        let mut leaf = traverse(ctx, root, SearchBound::Key(key), TraverseMode::FenceContain, LatchMode::Ex)?;
        if txn.needs_lock {
            match ctx.locks.acquire(txn.id, store, key, LockMode::XN, true)? {
                LockOutcome::Granted => {}
                LockOutcome::Retry => {
                    drop(leaf);
                    ctx.locks.acquire(txn.id, store, key, LockMode::XN, false)?;
                    continue;
                }
            }
        }
        let bytes = leaf.page().as_bytes();
        let (found, slot) = page::search(bytes, key);
        if !found || page::is_ghost(bytes, slot) {
            return Err(ShaleError::KeyNotFound { store });
        }
        let value = page::slot_value(bytes, slot);
        let off = offset as usize;
        if off + bytes_new.len() > value.len() {
            return Err(ShaleError::internal("overwrite beyond value bounds"));
        }
        let old = value[off..off + bytes_new.len()].to_vec();

        let rec_size = key.len() + 2 * bytes_new.len() + 32;
        let lsn = log_user(
            ctx,
            txn,
            store,
            leaf.pid(),
            LogPayload::BtreeOverwrite {
                key: key.to_vec(),
                offset,
                old,
                new: bytes_new.to_vec(),
            },
        )?;
        page::overwrite_value(leaf.page_mut().as_bytes_mut(), key, off, bytes_new)?;
        leaf.set_lsn(lsn);
        maybe_page_img(ctx, store, &mut leaf, rec_size)?;
        return Ok(());
    }
}

/// Logical delete: mark the record ghost. The slot stays for undo
/// reinstatement until a reclaim SSX defragments the page.
pub fn remove(
    ctx: &BtreeContext,
    txn: &mut TxnCtx,
    store: StoreId,
    root: PageId,
    key: &[u8],
) -> Result<()> {
    if txn.needs_lock {
        ctx.locks.intent_store_lock(txn.id, store, IntentMode::IX);
    }
    loop {
        let mut leaf = traverse(ctx, root, SearchBound::Key(key), TraverseMode::FenceContain, LatchMode::Ex)?;
        if txn.needs_lock {
            match ctx.locks.acquire(txn.id, store, key, LockMode::XN, true)? {
                LockOutcome::Granted => {}
                LockOutcome::Retry => {
                    drop(leaf);
                    ctx.locks.acquire(txn.id, store, key, LockMode::XN, false)?;
                    continue;
                }
            }
        }
        let bytes = leaf.page().as_bytes();
        let (found, slot) = page::search(bytes, key);
        if !found || page::is_ghost(bytes, slot) {
            return Err(ShaleError::KeyNotFound { store });
        }
        let rec_size = key.len() + 32;
        let lsn = log_user(
            ctx,
            txn,
            store,
            leaf.pid(),
            LogPayload::BtreeGhostMark {
                keys: vec![key.to_vec()],
            },
        )?;
        page::mark_ghost(leaf.page_mut().as_bytes_mut(), key)?;
        leaf.set_lsn(lsn);
        maybe_page_img(ctx, store, &mut leaf, rec_size)?;
        return Ok(());
    }
}

/// Sweep every leaf (foster children included) and reclaim committed
/// ghosts. Pages carrying locked ghosts are left alone.
pub fn reclaim_all_ghosts(ctx: &BtreeContext, store: StoreId, root: PageId) -> Result<()> {
    let mut cursor_key: Vec<u8> = Vec::new();
    loop {
        let mut leaf = traverse(
            ctx,
            root,
            SearchBound::Key(&cursor_key),
            TraverseMode::FenceContain,
            LatchMode::Ex,
        )?;
        let bytes = leaf.page().as_bytes();
        let ghosts: Vec<Vec<u8>> = (0..page::nrecs(bytes))
            .filter(|&i| page::is_ghost(bytes, i))
            .map(|i| page::slot_key(bytes, i).to_vec())
            .collect();
        if !ghosts.is_empty() && ghosts.iter().all(|k| !ctx.locks.is_locked(store, k)) {
            sx_reclaim_ghosts(ctx, store, &mut leaf, ghosts)?;
        }
        match page::fence_high(leaf.page().as_bytes()) {
            None => return Ok(()),
            Some(high) => {
                cursor_key = high.to_vec();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Logical undo entry points
// ---------------------------------------------------------------------------

/// Undo of an insert: logically remove the key. Re-traverses from the
/// root, takes no locks, logs a transaction-less ghost mark.
pub fn remove_as_undo(ctx: &BtreeContext, store: StoreId, root: PageId, key: &[u8]) -> Result<()> {
    let mut txn = TxnCtx::system();
    let mut leaf = traverse(ctx, root, SearchBound::Key(key), TraverseMode::FenceContain, LatchMode::Ex)?;
    let bytes = leaf.page().as_bytes();
    let (found, slot) = page::search(bytes, key);
    if !found || page::is_ghost(bytes, slot) {
        // Already gone (idempotent re-undo after a crash mid-abort).
        return Ok(());
    }
    let lsn = log_user(
        ctx,
        &mut txn,
        store,
        leaf.pid(),
        LogPayload::BtreeGhostMark {
            keys: vec![key.to_vec()],
        },
    )?;
    page::mark_ghost(leaf.page_mut().as_bytes_mut(), key)?;
    leaf.set_lsn(lsn);
    Ok(())
}

/// Undo of an update: restore the old value.
pub fn update_as_undo(
    ctx: &BtreeContext,
    store: StoreId,
    root: PageId,
    key: &[u8],
    old: &[u8],
) -> Result<()> {
    let mut txn = TxnCtx::system();
    loop {
        let mut leaf =
            traverse(ctx, root, SearchBound::Key(key), TraverseMode::FenceContain, LatchMode::Ex)?;
        let bytes = leaf.page().as_bytes();
        let (found, slot) = page::search(bytes, key);
        if !found {
            return Err(ShaleError::internal("update undo: key vanished"));
        }
        let current = page::slot_value(bytes, slot).to_vec();
        if current == old {
            return Ok(());
        }
        let capacity = page::record_capacity(bytes, slot);
        if old.len() > capacity && 4 + key.len() + old.len() > page::free_space(bytes) {
            sx_split(ctx, store, &mut leaf)?;
            drop(leaf);
            continue;
        }
        let lsn = log_user(
            ctx,
            &mut txn,
            store,
            leaf.pid(),
            LogPayload::BtreeUpdate {
                key: key.to_vec(),
                old: current,
                new: old.to_vec(),
            },
        )?;
        page::replace_value(leaf.page_mut().as_bytes_mut(), key, old)?;
        leaf.set_lsn(lsn);
        return Ok(());
    }
}

/// Undo of a partial overwrite: restore the old bytes at the offset.
pub fn overwrite_as_undo(
    ctx: &BtreeContext,
    store: StoreId,
    root: PageId,
    key: &[u8],
    old: &[u8],
    offset: u16,
) -> Result<()> {
    let mut txn = TxnCtx::system();
    let mut leaf = traverse(ctx, root, SearchBound::Key(key), TraverseMode::FenceContain, LatchMode::Ex)?;
    let bytes = leaf.page().as_bytes();
    let (found, slot) = page::search(bytes, key);
    if !found {
        return Err(ShaleError::internal("overwrite undo: key vanished"));
    }
    let off = offset as usize;
    let current = page::slot_value(bytes, slot)[off..off + old.len()].to_vec();
    if current == old {
        return Ok(());
    }
    let lsn = log_user(
        ctx,
        &mut txn,
        store,
        leaf.pid(),
        LogPayload::BtreeOverwrite {
            key: key.to_vec(),
            offset,
            old: current,
            new: old.to_vec(),
        },
    )?;
    page::overwrite_value(leaf.page_mut().as_bytes_mut(), key, off, old)?;
    leaf.set_lsn(lsn);
    Ok(())
}

/// Undo of a ghost mark: bring the record back. Logged as an insert
/// (redo re-fills the still-present ghost slot).
pub fn undo_ghost_mark(ctx: &BtreeContext, store: StoreId, root: PageId, key: &[u8]) -> Result<()> {
    let mut txn = TxnCtx::system();
    let mut leaf = traverse(ctx, root, SearchBound::Key(key), TraverseMode::FenceContain, LatchMode::Ex)?;
    let bytes = leaf.page().as_bytes();
    let (found, slot) = page::search(bytes, key);
    if !found {
        return Err(ShaleError::internal("ghost-mark undo: slot reclaimed"));
    }
    if !page::is_ghost(bytes, slot) {
        return Ok(());
    }
    let value = page::slot_value(bytes, slot).to_vec();
    let lsn = log_user(
        ctx,
        &mut txn,
        store,
        leaf.pid(),
        LogPayload::BtreeInsert {
            key: key.to_vec(),
            value: value.clone(),
        },
    )?;
    page::replace_ghost(leaf.page_mut().as_bytes_mut(), key, &value)?;
    leaf.set_lsn(lsn);
    Ok(())
}

// ---------------------------------------------------------------------------
// Redo adapter
// ---------------------------------------------------------------------------

/// Adapts a latched frame's bytes to the log crate's page capability.
pub struct RedoFrame<'a> {
    pid: PageId,
    bytes: &'a mut [u8],
}

impl<'a> RedoFrame<'a> {
    #[must_use]
    pub fn new(pid: PageId, bytes: &'a mut [u8]) -> Self {
        Self { pid, bytes }
    }
}

impl RedoPage for RedoFrame<'_> {
    fn pid(&self) -> PageId {
        self.pid
    }
    fn replace_ghost(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        page::replace_ghost(self.bytes, key, value)
    }
    fn insert_nonghost(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        page::insert_nonghost(self.bytes, key, value)
    }
    fn replace_value(&mut self, key: &[u8], new: &[u8]) -> Result<()> {
        page::replace_value(self.bytes, key, new)
    }
    fn overwrite_value(&mut self, key: &[u8], offset: u16, bytes: &[u8]) -> Result<()> {
        page::overwrite_value(self.bytes, key, offset as usize, bytes)
    }
    fn mark_ghost(&mut self, key: &[u8]) -> Result<()> {
        page::mark_ghost(self.bytes, key)
    }
    fn reserve_ghost(&mut self, key: &[u8], value_len: usize) -> Result<()> {
        page::reserve_ghost(self.bytes, key, value_len)
    }
    fn reclaim_ghosts(&mut self) -> Result<()> {
        page::reclaim_ghosts(self.bytes)
    }
    fn format_steal(&mut self, image: &[u8]) -> Result<()> {
        page::format_steal(self.bytes, image)
    }
    fn format_empty(
        &mut self,
        store: StoreId,
        level: u8,
        fence_low: &[u8],
        fence_high: &[u8],
        _chain_high: &[u8],
    ) -> Result<()> {
        page::format(
            self.bytes,
            &FormatSpec {
                pid: self.pid,
                store,
                level,
                fence_low,
                fence_high: dec_fence(fence_high),
                chain_high: None,
                foster: None,
                pid0: None,
            },
        );
        Ok(())
    }
    fn accept_empty_child(&mut self, child: PageId, child_fence_low: &[u8]) -> Result<()> {
        let chain = page::chain_high(self.bytes).map(<[u8]>::to_vec);
        page::set_foster_child(
            self.bytes,
            Foster {
                pid: child,
                emlsn: Lsn::NULL,
            },
            child_fence_low,
            chain.as_deref(),
        )
    }
    fn split_parent_apply(
        &mut self,
        move_count: usize,
        child: PageId,
        new_high_fence: &[u8],
        new_chain_high: &[u8],
    ) -> Result<()> {
        let n = page::nrecs(self.bytes);
        if n < move_count {
            return Err(ShaleError::internal("split redo: fewer records than moved"));
        }
        page::delete_range(self.bytes, n - move_count, n)?;
        page::set_foster_child(
            self.bytes,
            Foster {
                pid: child,
                emlsn: Lsn::NULL,
            },
            new_high_fence,
            dec_fence(new_chain_high),
        )
    }
    fn adopt_apply_parent(&mut self, child: PageId, emlsn: Lsn, separator: &[u8]) -> Result<()> {
        page::insert_child(self.bytes, separator, child, emlsn)
    }
    fn adopt_apply_child(&mut self) -> Result<()> {
        page::clear_foster(self.bytes);
        Ok(())
    }
    fn compress(&mut self, fence_low: &[u8], fence_high: &[u8], chain_high: &[u8]) -> Result<()> {
        page::compress(
            self.bytes,
            fence_low,
            dec_fence(fence_high),
            dec_fence(chain_high),
        )
    }
    fn grow_root_apply(
        &mut self,
        level: u8,
        fence_low: &[u8],
        fence_high: &[u8],
        child: PageId,
    ) -> Result<()> {
        let store = page::store(self.bytes);
        page::format(
            self.bytes,
            &FormatSpec {
                pid: self.pid,
                store,
                level,
                fence_low,
                fence_high: dec_fence(fence_high),
                chain_high: None,
                foster: None,
                pid0: Some((child, Lsn::NULL)),
            },
        );
        Ok(())
    }
}
