//! Consolidation array: coalesces concurrent log-insert reservations.
//!
//! Serializing every writer on the insert gate makes the gate the
//! bottleneck at small record sizes. The consolidation array lets
//! concurrent writers form a *group*: the first writer into an open slot
//! becomes the group leader, later writers add their sizes, and the leader
//! performs **one** reservation for the whole group. Each member then
//! copies into its granted sub-range without any lock.
//!
//! ```text
//! writer A ─┐
//! writer B ─┼─▶ slot (open) ──leader──▶ one gate acquisition,
//! writer C ─┘                           one contiguous reservation
//!                ▲                          │
//!                └── grants distributed ────┘
//! ```
//!
//! The slot closes while the leader reserves; a closed slot makes late
//! arrivals wait for the next generation rather than spilling into an
//! unbounded queue.

use parking_lot::{Condvar, Mutex};
use shale_error::{Result, ShaleError};
use shale_types::Lsn;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A granted log-buffer range: the record's LSN and its virtual byte
/// position in the insert buffer's coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub lsn: Lsn,
    pub vpos: u64,
}

#[derive(Default)]
struct SlotState {
    /// Accepting joiners. Closed from leader-reserve until the last grant
    /// is collected.
    open: bool,
    sizes: Vec<usize>,
    /// Total bytes joined so far; a group never grows past the byte cap,
    /// which is what lets the reservation path wait for buffer space
    /// without deadlocking against its own ungranted members.
    bytes: usize,
    grants: Vec<Option<Reservation>>,
    failed: bool,
    taken: usize,
}

struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                open: true,
                ..SlotState::default()
            }),
            cond: Condvar::new(),
        }
    }
}

/// The consolidation array itself: a small fixed set of slots, picked
/// round-robin to spread contention.
pub struct ConsolidationArray {
    slots: Box<[Slot]>,
    next: AtomicUsize,
    max_group_bytes: usize,
}

impl ConsolidationArray {
    #[must_use]
    pub fn new(nslots: usize, max_group_bytes: usize) -> Self {
        let slots = (0..nslots.max(1)).map(|_| Slot::new()).collect();
        Self {
            slots,
            next: AtomicUsize::new(0),
            max_group_bytes: max_group_bytes.max(1),
        }
    }

    /// Join a group with a record of `size` bytes.
    ///
    /// Exactly one member of each group (the leader) invokes `reserve`
    /// with every member's size in join order; `reserve` returns one
    /// [`Reservation`] per member. Everyone — leader included — gets their
    /// own grant back from this call.
    pub fn join<F>(&self, size: usize, reserve: F) -> Result<Reservation>
    where
        F: FnOnce(&[usize]) -> Result<Vec<Reservation>>,
    {
        let slot_idx = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let slot = &self.slots[slot_idx];

        let my_idx;
        {
            let mut st = slot.state.lock();
            // A full-but-open group also makes late arrivals wait for
            // the next generation (a lone oversized record may still
            // form a group of one).
            while !st.open
                || (!st.sizes.is_empty() && st.bytes + size > self.max_group_bytes)
            {
                slot.cond.wait(&mut st);
            }
            st.sizes.push(size);
            st.bytes += size;
            my_idx = st.sizes.len() - 1;
        }

        if my_idx == 0 {
            self.lead(slot, reserve)
        } else {
            Self::follow(slot, my_idx)
        }
    }

    fn lead<F>(&self, slot: &Slot, reserve: F) -> Result<Reservation>
    where
        F: FnOnce(&[usize]) -> Result<Vec<Reservation>>,
    {
        // Give concurrent writers one scheduling window to pile in before
        // the group closes.
        std::thread::yield_now();

        let sizes = {
            let mut st = slot.state.lock();
            st.open = false;
            st.sizes.clone()
        };

        let outcome = reserve(&sizes);

        let mut st = slot.state.lock();
        let my_grant = match &outcome {
            Ok(grants) => {
                debug_assert_eq!(grants.len(), sizes.len());
                st.grants = grants.iter().copied().map(Some).collect();
                st.grants[0]
            }
            Err(_) => {
                st.failed = true;
                None
            }
        };
        st.taken += 1;
        Self::maybe_reset(&mut st, slot);
        drop(st);
        slot.cond.notify_all();

        match outcome {
            Ok(_) => Ok(my_grant.unwrap_or_else(|| unreachable!("leader grant present"))),
            Err(e) => Err(e),
        }
    }

    fn follow(slot: &Slot, my_idx: usize) -> Result<Reservation> {
        let mut st = slot.state.lock();
        loop {
            if st.failed {
                st.taken += 1;
                Self::maybe_reset(&mut st, slot);
                return Err(ShaleError::internal(
                    "log reservation failed for the group leader",
                ));
            }
            if let Some(grant) = st.grants.get(my_idx).copied().flatten() {
                st.taken += 1;
                Self::maybe_reset(&mut st, slot);
                return Ok(grant);
            }
            slot.cond.wait(&mut st);
        }
    }

    /// Reopen the slot once every member of the closed group has taken
    /// its grant (or observed the group failure).
    fn maybe_reset(st: &mut SlotState, slot: &Slot) {
        if !st.open && st.taken == st.sizes.len() {
            st.open = true;
            st.sizes.clear();
            st.bytes = 0;
            st.grants.clear();
            st.failed = false;
            st.taken = 0;
            slot.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    /// A reserve backend handing out densely packed positions.
    fn dense_reserver(counter: Arc<AtomicU64>) -> impl Fn(&[usize]) -> Result<Vec<Reservation>> {
        move |sizes| {
            let total: usize = sizes.iter().sum();
            let base = counter.fetch_add(total as u64, Ordering::SeqCst);
            let mut out = Vec::with_capacity(sizes.len());
            let mut at = base;
            for &s in sizes {
                out.push(Reservation {
                    lsn: Lsn::new(1, at as u32),
                    vpos: at,
                });
                at += s as u64;
            }
            Ok(out)
        }
    }

    #[test]
    fn single_writer_gets_a_grant() {
        let carray = ConsolidationArray::new(2, 1 << 20);
        let counter = Arc::new(AtomicU64::new(0));
        let r = carray.join(64, dense_reserver(counter)).unwrap();
        assert_eq!(r.vpos, 0);
    }

    #[test]
    fn sequential_joins_are_dense() {
        let carray = ConsolidationArray::new(1, 1 << 20);
        let counter = Arc::new(AtomicU64::new(0));
        let a = carray.join(64, dense_reserver(counter.clone())).unwrap();
        let b = carray.join(32, dense_reserver(counter.clone())).unwrap();
        let c = carray.join(128, dense_reserver(counter)).unwrap();
        assert_eq!(a.vpos, 0);
        assert_eq!(b.vpos, 64);
        assert_eq!(c.vpos, 96);
    }

    #[test]
    fn concurrent_joins_get_disjoint_dense_ranges() {
        const THREADS: usize = 16;
        const PER_THREAD: usize = 50;
        const SIZE: usize = 48;

        let carray = Arc::new(ConsolidationArray::new(4, 1 << 20));
        let counter = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let carray = Arc::clone(&carray);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                let mut mine = Vec::new();
                for _ in 0..PER_THREAD {
                    let r = carray.join(SIZE, dense_reserver(counter.clone())).unwrap();
                    mine.push(r.vpos);
                }
                mine
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all.len(), THREADS * PER_THREAD);
        // Dense and disjoint: positions are exactly 0, SIZE, 2*SIZE, ...
        for (i, vpos) in all.iter().enumerate() {
            assert_eq!(*vpos, (i * SIZE) as u64);
        }
    }

    #[test]
    fn leader_failure_fails_the_group_but_slot_recovers() {
        let carray = ConsolidationArray::new(1, 1 << 20);
        let r = carray.join(16, |_| {
            Err::<Vec<Reservation>, _>(ShaleError::internal("disk gone"))
        });
        assert!(r.is_err());

        // The slot must be usable again afterwards.
        let counter = Arc::new(AtomicU64::new(0));
        let r = carray.join(16, dense_reserver(counter)).unwrap();
        assert_eq!(r.vpos, 0);
    }
}
