//! Range-scan cursor over one B-tree.
//!
//! The cursor anchors its position on the *key* it last returned, never
//! on a slot number: every re-entry re-validates the remembered page by
//! `(pid, lsn)` and re-locates the slot by key when anything moved, so
//! structural changes between calls cost a re-search, not correctness.
//!
//! Locking follows the key-range discipline: an exact first hit takes a
//! key+gap lock (`XX`/`SS`) and arms `dont_move_next` so the first
//! `next()` returns that record; a miss locks the would-be successor (or
//! the leaf's low fence at the left edge) without the gap. Crossing a
//! page boundary unfixes, locks the neighbor's fence key (the neighbor
//! may have moved meanwhile), and re-traverses by fence match. A lock
//! request that would block under the latch comes back `Retry`: unfix,
//! blocking acquire, re-validate, resume — no progress is lost.
//!
//! After any relock or re-traversal the cursor re-checks bounds and
//! ghost-ness before emitting, so it never returns a ghost or an
//! out-of-range key (at the price of occasionally holding a lock on a
//! vanished key until commit).

use shale_bufpool::{LatchMode, PageGuard};
use shale_error::Result;
use shale_lock::{IntentMode, LockMode, LockOutcome};
use shale_types::{Lsn, PageId, StoreId, TxnId};

use crate::page;
use crate::tree::{BtreeContext, SearchBound, TraverseMode, TxnCtx, traverse};

/// Externally observable cursor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Built, not yet positioned.
    Fresh,
    /// Holding a current record.
    Positioned,
    /// Ran off the range.
    Eof,
    /// Closed by the caller.
    Closed,
}

/// A range cursor with inclusive/exclusive bounds and a direction.
pub struct BtCursor<'c> {
    ctx: &'c BtreeContext,
    txn: TxnId,
    needs_lock: bool,
    ex_lock: bool,
    store: StoreId,
    root: PageId,

    lower: Vec<u8>,
    lower_inc: bool,
    /// `None` is the supremum (scan to the end).
    upper: Option<Vec<u8>>,
    upper_inc: bool,
    forward: bool,

    first_time: bool,
    dont_move_next: bool,
    eof: bool,
    closed: bool,

    pid: PageId,
    lsn: Lsn,
    slot: isize,
    key: Vec<u8>,
    /// True while `key` is a fence key used as a positional anchor (left
    /// edge of a miss): such an anchor may coincide with a record that
    /// still has to be emitted, so re-positioning must not step past it.
    anchor_is_fence: bool,
    value: Vec<u8>,
}

impl<'c> BtCursor<'c> {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        ctx: &'c BtreeContext,
        txn: &TxnCtx,
        store: StoreId,
        root: PageId,
        lower: Vec<u8>,
        lower_inc: bool,
        upper: Option<Vec<u8>>,
        upper_inc: bool,
        forward: bool,
    ) -> Self {
        Self {
            ctx,
            txn: txn.id,
            needs_lock: txn.needs_lock,
            ex_lock: txn.ex_lock,
            store,
            root,
            lower,
            lower_inc,
            upper,
            upper_inc,
            forward,
            first_time: true,
            dont_move_next: false,
            eof: false,
            closed: false,
            pid: 0,
            lsn: Lsn::NULL,
            slot: -1,
            key: Vec::new(),
            anchor_is_fence: false,
            value: Vec::new(),
        }
    }

    /// Whole-tree scan.
    #[must_use]
    pub fn full(
        ctx: &'c BtreeContext,
        txn: &TxnCtx,
        store: StoreId,
        root: PageId,
        forward: bool,
    ) -> Self {
        Self::new(ctx, txn, store, root, Vec::new(), true, None, true, forward)
    }

    #[must_use]
    pub fn state(&self) -> CursorState {
        if self.closed {
            CursorState::Closed
        } else if self.eof {
            CursorState::Eof
        } else if self.first_time {
            CursorState::Fresh
        } else {
            CursorState::Positioned
        }
    }

    /// Key of the current record (valid after `next()` returned true).
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Value of the current record.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.slot = -1;
        self.pid = 0;
        self.lsn = Lsn::NULL;
        self.key.clear();
        self.value.clear();
    }

    /// Advance to the next record in scan order. Returns false at EOF.
    pub fn next(&mut self) -> Result<bool> {
        if self.closed || self.eof {
            return Ok(false);
        }
        if self.first_time {
            self.first_time = false;
            self.locate_first()?;
            if self.eof {
                return Ok(false);
            }
        }

        let p = self.ctx.pool.fix(self.pid, LatchMode::Sh, true)?;
        let p = self.revalidate(p)?;
        match self.find_next(p)? {
            Some(p) => {
                self.make_rec(&p);
                Ok(true)
            }
            None => {
                self.eof = true;
                Ok(false)
            }
        }
    }

    fn lock_mode(&self, key_part: bool, gap_part: bool) -> LockMode {
        use shale_lock::LockBase;
        let strength = if self.ex_lock { LockBase::X } else { LockBase::S };
        LockMode::new(
            if key_part { strength } else { LockBase::N },
            if gap_part { strength } else { LockBase::N },
        )
    }

    /// Position on the first candidate record and take its lock.
    fn locate_first(&mut self) -> Result<()> {
        if self.needs_lock {
            let intent = if self.ex_lock {
                IntentMode::IX
            } else {
                IntentMode::IS
            };
            self.ctx.locks.intent_store_lock(self.txn, self.store, intent);
        }

        if let Some(upper) = &self.upper {
            if self.lower > *upper
                || (self.lower == *upper && (!self.lower_inc || !self.upper_inc))
            {
                self.eof = true;
                return Ok(());
            }
        }

        // Loop because the key lock may come back Retry.
        loop {
            let bound = if self.forward {
                SearchBound::Key(&self.lower)
            } else {
                match &self.upper {
                    Some(u) => SearchBound::Key(u),
                    None => SearchBound::Supremum,
                }
            };
            let p = traverse(self.ctx, self.root, bound, TraverseMode::FenceContain, LatchMode::Sh)?;
            self.pid = p.pid();
            self.lsn = p.lsn();
            let bytes = p.page().as_bytes();

            let (found, ins) = match bound {
                SearchBound::Key(k) => page::search(bytes, k),
                SearchBound::Supremum => (false, page::nrecs(bytes)),
            };

            let mode;
            self.anchor_is_fence = false;
            if found {
                self.key = if self.forward {
                    self.lower.clone()
                } else {
                    self.upper.clone().unwrap_or_default()
                };
                self.slot = ins as isize;
                if self.forward {
                    if self.lower_inc {
                        // Take the gap too, saving one lock call for the
                        // common point-start scan.
                        mode = self.lock_mode(true, true);
                        self.dont_move_next = true;
                    } else {
                        mode = self.lock_mode(false, true);
                        self.dont_move_next = false;
                    }
                } else if self.upper_inc {
                    mode = self.lock_mode(true, false);
                    self.dont_move_next = true;
                } else {
                    // Exclusive upper at the exact key: nothing to lock;
                    // the key may legally disappear under us.
                    mode = LockMode::NN;
                    self.dont_move_next = false;
                }
            } else {
                // ins is the insert position: keys[ins-1] < key < keys[ins].
                self.slot = ins as isize - 1;
                if self.forward {
                    self.dont_move_next = false;
                    self.key = if self.slot < 0 {
                        self.anchor_is_fence = true;
                        page::fence_low(bytes).to_vec()
                    } else {
                        page::slot_key(bytes, self.slot as usize).to_vec()
                    };
                    mode = self.lock_mode(false, true);
                } else if self.slot < 0 {
                    self.dont_move_next = false;
                    self.anchor_is_fence = true;
                    self.key = page::fence_low(bytes).to_vec();
                    mode = self.lock_mode(false, true);
                } else {
                    self.dont_move_next = true;
                    self.key = page::slot_key(bytes, self.slot as usize).to_vec();
                    mode = self.lock_mode(true, true);
                }
            }

            if self.needs_lock && !mode.is_empty() {
                match self
                    .ctx
                    .locks
                    .acquire(self.txn, self.store, &self.key, mode, true)?
                {
                    LockOutcome::Granted => {}
                    LockOutcome::Retry => {
                        drop(p);
                        self.ctx
                            .locks
                            .acquire(self.txn, self.store, &self.key, mode, false)?;
                        continue;
                    }
                }
            }
            return Ok(());
        }
    }

    /// Re-locate the page containing the anchor key after a possible
    /// move, leaving the slot untouched.
    fn reposition(&mut self, p: PageGuard<'c>) -> Result<PageGuard<'c>> {
        let p = if page::fence_contains(p.page().as_bytes(), &self.key) {
            p
        } else {
            drop(p);
            traverse(
                self.ctx,
                self.root,
                SearchBound::Key(&self.key),
                TraverseMode::FenceContain,
                LatchMode::Sh,
            )?
        };
        self.pid = p.pid();
        self.lsn = p.lsn();
        Ok(p)
    }

    /// Re-validate the remembered position against the current page.
    /// Returns a guard on the (possibly re-located) page with `slot`
    /// adjusted so the normal advance logic lands right.
    fn revalidate(&mut self, p: PageGuard<'c>) -> Result<PageGuard<'c>> {
        if self.pid == p.pid() && p.lsn() == self.lsn {
            return Ok(p);
        }
        let p = self.reposition(p)?;
        let (found, ins) = page::search(p.page().as_bytes(), &self.key);
        if found {
            // A fence anchor that coincides with a record must still be
            // visited by the upcoming advance; an emitted anchor must
            // not be re-emitted.
            self.slot = if self.forward && self.anchor_is_fence {
                ins as isize - 1
            } else {
                ins as isize
            };
        } else {
            // The anchor key is gone (ghost reclaimed). The insert
            // position already names its successor.
            self.dont_move_next = false;
            self.slot = if self.forward {
                ins as isize - 1
            } else {
                ins as isize
            };
        }
        Ok(p)
    }

    fn in_bounds(&self, key: &[u8]) -> bool {
        let lower_ok = match key.cmp(&self.lower) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => self.lower_inc,
            std::cmp::Ordering::Less => false,
        };
        let upper_ok = match &self.upper {
            None => true,
            Some(u) => match key.cmp(u.as_slice()) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => self.upper_inc,
                std::cmp::Ordering::Greater => false,
            },
        };
        lower_ok && upper_ok
    }

    /// Move to the next non-ghost record, honoring `dont_move_next`.
    fn find_next(&mut self, mut p: PageGuard<'c>) -> Result<Option<PageGuard<'c>>> {
        loop {
            if self.dont_move_next {
                self.dont_move_next = false;
                let bytes = p.page().as_bytes();
                let slot = self.slot as usize;
                if self.slot >= 0
                    && slot < page::nrecs(bytes)
                    && !page::is_ghost(bytes, slot)
                    && self.in_bounds(page::slot_key(bytes, slot))
                {
                    return Ok(Some(p));
                }
                // Armed slot is unusable (ghost, vanished, or out of
                // range): fall through to a normal advance.
            }
            match self.advance_one_slot(p)? {
                None => return Ok(None),
                Some(np) => {
                    let bytes = np.page().as_bytes();
                    if page::is_ghost(bytes, self.slot as usize) {
                        p = np;
                        continue;
                    }
                    return Ok(Some(np));
                }
            }
        }
    }

    /// One slot forward/backward, crossing pages by fence key as needed.
    /// Returns `None` at EOF.
    fn advance_one_slot(&mut self, mut p: PageGuard<'c>) -> Result<Option<PageGuard<'c>>> {
        self.slot += if self.forward { 1 } else { -1 };

        // Loop: consecutive empty pages may need several crossings.
        loop {
            let bytes = p.page().as_bytes();
            let n = page::nrecs(bytes) as isize;
            let time2move = if self.forward {
                self.slot >= n
            } else {
                self.slot < 0
            };

            if time2move {
                let reached_end = if self.forward {
                    page::fence_high(bytes).is_none()
                } else {
                    page::fence_low(bytes).is_empty()
                };
                if reached_end {
                    return Ok(None);
                }

                let mut only_low_fence_exact_match = false;
                let (neighboring_fence, traverse_mode) = if self.forward {
                    let nf = page::fence_high(bytes)
                        .unwrap_or_else(|| unreachable!("checked above"))
                        .to_vec();
                    if let Some(u) = &self.upper {
                        match u.as_slice().cmp(&nf) {
                            std::cmp::Ordering::Less => return Ok(None),
                            std::cmp::Ordering::Equal => {
                                if !self.upper_inc {
                                    return Ok(None);
                                }
                                // The only possible match on the next
                                // page is its low fence key itself.
                                only_low_fence_exact_match = true;
                            }
                            std::cmp::Ordering::Greater => {}
                        }
                    }
                    (nf, TraverseMode::FenceLowMatch)
                } else {
                    let nf = page::fence_low(bytes).to_vec();
                    if self.lower.as_slice() >= nf.as_slice() {
                        return Ok(None);
                    }
                    (nf, TraverseMode::FenceHighMatch)
                };
                drop(p);

                // The neighbor may move while we are unlatched, so the
                // fence key itself gets locked, unconditionally.
                if self.needs_lock {
                    let mode = if only_low_fence_exact_match {
                        self.lock_mode(true, false)
                    } else {
                        self.lock_mode(true, true)
                    };
                    self.ctx
                        .locks
                        .acquire(self.txn, self.store, &neighboring_fence, mode, false)?;
                }

                p = traverse(
                    self.ctx,
                    self.root,
                    SearchBound::Key(&neighboring_fence),
                    traverse_mode,
                    LatchMode::Sh,
                )?;
                self.slot = if self.forward {
                    0
                } else {
                    page::nrecs(p.page().as_bytes()) as isize - 1
                };
                self.pid = p.pid();
                self.lsn = p.lsn();
                continue;
            }

            // Candidate record. Until its lock lands we cannot be sure it
            // stays the next key, so the cursor key is updated last.
            let cand = page::slot_key(bytes, self.slot as usize).to_vec();
            let mut at_eof = false;
            let mode = if self.forward {
                match &self.upper {
                    None => self.lock_mode(true, true),
                    Some(u) => match cand.cmp(u) {
                        std::cmp::Ordering::Less => self.lock_mode(true, true),
                        std::cmp::Ordering::Equal if self.upper_inc => self.lock_mode(true, false),
                        _ => {
                            at_eof = true;
                            LockMode::NN
                        }
                    },
                }
            } else {
                match cand.as_slice().cmp(self.lower.as_slice()) {
                    std::cmp::Ordering::Greater => self.lock_mode(true, true),
                    std::cmp::Ordering::Equal if self.lower_inc => self.lock_mode(true, true),
                    _ => {
                        // Past the lower bound: done, but the gap below
                        // the bound still gets protected.
                        at_eof = true;
                        self.lock_mode(false, true)
                    }
                }
            };

            if self.needs_lock && !mode.is_empty() {
                match self
                    .ctx
                    .locks
                    .acquire(self.txn, self.store, &cand, mode, true)?
                {
                    LockOutcome::Granted => {}
                    LockOutcome::Retry => {
                        drop(p);
                        self.ctx
                            .locks
                            .acquire(self.txn, self.store, &cand, mode, false)?;
                        // Re-anchor on the cursor key from scratch: the
                        // candidate (and even the anchor) may have moved
                        // while unlatched.
                        let np = self.ctx.pool.fix(self.pid, LatchMode::Sh, true)?;
                        p = self.reposition(np)?;
                        let (found, ins) =
                            page::search(p.page().as_bytes(), &self.key);
                        let base = ins as isize;
                        self.slot = if self.forward {
                            if found && !self.anchor_is_fence {
                                base + 1
                            } else {
                                base
                            }
                        } else {
                            base - 1
                        };
                        continue;
                    }
                }
            }
            if at_eof {
                return Ok(None);
            }
            self.key = cand;
            self.anchor_is_fence = false;
            return Ok(Some(p));
        }
    }

    fn make_rec(&mut self, p: &PageGuard<'c>) {
        let bytes = p.page().as_bytes();
        let slot = self.slot as usize;
        debug_assert!(!page::is_ghost(bytes, slot));
        debug_assert_eq!(page::slot_key(bytes, slot), self.key.as_slice());
        self.value = page::slot_value(bytes, slot).to_vec();
        self.pid = p.pid();
        self.lsn = p.lsn();
    }
}
