//! The lock table.
//!
//! Bucketed by lock-id hash; each bucket holds exact `(store, key)` queues
//! so hash collisions never manufacture conflicts. Grants are recorded per
//! transaction and held until `release_all` at commit/abort.
//!
//! Three ways a conflicting acquire resolves:
//! - caller holds a latch → `Ok(LockOutcome::Retry)`; the caller unfixes
//!   and re-acquires blocking (the cursor's `eLOCKRETRY` discipline);
//! - wait-die: a requester younger than a conflicting holder is the
//!   deadlock victim immediately;
//! - otherwise wait on the bucket condvar, bounded by the timeout.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use shale_error::{Result, ShaleError};
use shale_types::{StoreId, TxnId};
use tracing::{debug, trace};

use crate::okvl::{IntentMode, LockMode};

/// Outcome of a lock acquisition that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock is held (new, merged, or already covered).
    Granted,
    /// The manager would have to block but the caller holds a latch:
    /// release it, then re-acquire with `latched = false`.
    Retry,
}

/// Lock-manager tunables.
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Blocking-wait bound in milliseconds.
    pub lock_timeout_ms: u64,
    /// Number of hash buckets.
    pub buckets: usize,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
            buckets: 64,
        }
    }
}

impl LockManagerConfig {
    #[must_use]
    pub fn validated(mut self) -> Self {
        self.buckets = self.buckets.clamp(1, 4096);
        self.lock_timeout_ms = self.lock_timeout_ms.max(1);
        self
    }
}

type LockId = (StoreId, Vec<u8>);

#[derive(Default)]
struct Bucket {
    queues: Mutex<HashMap<LockId, Vec<(TxnId, LockMode)>>>,
    cond: Condvar,
}

/// The key-range lock manager.
pub struct LockManager {
    cfg: LockManagerConfig,
    buckets: Box<[Bucket]>,
    /// Store intent locks; IS/IX never conflict, so this is bookkeeping
    /// for release and introspection only.
    intents: Mutex<HashMap<StoreId, Vec<(TxnId, IntentMode)>>>,
}

impl LockManager {
    #[must_use]
    pub fn new(cfg: LockManagerConfig) -> Self {
        let cfg = cfg.validated();
        let buckets = (0..cfg.buckets).map(|_| Bucket::default()).collect();
        Self {
            cfg,
            buckets,
            intents: Mutex::new(HashMap::new()),
        }
    }

    fn bucket_of(&self, store: StoreId, key: &[u8]) -> &Bucket {
        let mut h = DefaultHasher::new();
        store.hash(&mut h);
        key.hash(&mut h);
        &self.buckets[(h.finish() as usize) % self.buckets.len()]
    }

    /// Take a store intent lock. Always grants in this engine's mode set.
    pub fn intent_store_lock(&self, txn: TxnId, store: StoreId, mode: IntentMode) {
        let mut intents = self.intents.lock();
        let held = intents.entry(store).or_default();
        if let Some(entry) = held.iter_mut().find(|(t, _)| *t == txn) {
            if entry.1 == IntentMode::IS && mode == IntentMode::IX {
                entry.1 = IntentMode::IX;
            }
        } else {
            held.push((txn, mode));
        }
        trace!(%txn, store, ?mode, "intent store lock");
    }

    /// Acquire (or strengthen) a key lock.
    ///
    /// `latched` tells the manager the caller still holds a page latch;
    /// a would-block acquisition then returns [`LockOutcome::Retry`]
    /// instead of waiting.
    pub fn acquire(
        &self,
        txn: TxnId,
        store: StoreId,
        key: &[u8],
        mode: LockMode,
        latched: bool,
    ) -> Result<LockOutcome> {
        if mode.is_empty() {
            return Ok(LockOutcome::Granted);
        }
        let bucket = self.bucket_of(store, key);
        let deadline = Instant::now() + Duration::from_millis(self.cfg.lock_timeout_ms);
        let mut queues = bucket.queues.lock();
        loop {
            let queue = queues.entry((store, key.to_vec())).or_default();

            if let Some((_, held)) = queue.iter().find(|(t, _)| *t == txn) {
                if held.covers(mode) {
                    return Ok(LockOutcome::Granted);
                }
            }
            let wanted = queue
                .iter()
                .find(|(t, _)| *t == txn)
                .map_or(mode, |(_, held)| held.union(mode));

            let conflict = queue
                .iter()
                .find(|(t, held)| *t != txn && !held.compatible(wanted));

            match conflict {
                None => {
                    if let Some(entry) = queue.iter_mut().find(|(t, _)| *t == txn) {
                        entry.1 = wanted;
                    } else {
                        queue.push((txn, wanted));
                    }
                    trace!(%txn, store, mode = %wanted, "lock granted");
                    return Ok(LockOutcome::Granted);
                }
                Some(&(holder, holder_mode)) => {
                    if latched {
                        trace!(%txn, store, mode = %mode, %holder, "lock retry (latched)");
                        return Ok(LockOutcome::Retry);
                    }
                    // Wait-die: younger requesters die rather than wait
                    // behind an older holder.
                    if txn.0 > holder.0 {
                        debug!(%txn, %holder, holder_mode = %holder_mode, "wait-die victim");
                        return Err(ShaleError::Deadlock { txn: txn.0 });
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ShaleError::LockTimeout {
                            waited_ms: self.cfg.lock_timeout_ms,
                            holder: holder.0,
                        });
                    }
                    let timed_out = bucket
                        .cond
                        .wait_until(&mut queues, deadline)
                        .timed_out();
                    if timed_out {
                        return Err(ShaleError::LockTimeout {
                            waited_ms: self.cfg.lock_timeout_ms,
                            holder: holder.0,
                        });
                    }
                }
            }
        }
    }

    /// The mode `txn` currently holds on `(store, key)`, if any.
    #[must_use]
    pub fn granted_mode(&self, txn: TxnId, store: StoreId, key: &[u8]) -> LockMode {
        let bucket = self.bucket_of(store, key);
        let queues = bucket.queues.lock();
        queues
            .get(&(store, key.to_vec()))
            .and_then(|q| q.iter().find(|(t, _)| *t == txn))
            .map_or(LockMode::NN, |(_, m)| *m)
    }

    /// Whether any transaction holds any lock on `(store, key)`. Ghost
    /// reclamation uses this to leave in-flight deletes alone.
    #[must_use]
    pub fn is_locked(&self, store: StoreId, key: &[u8]) -> bool {
        let bucket = self.bucket_of(store, key);
        let queues = bucket.queues.lock();
        queues
            .get(&(store, key.to_vec()))
            .is_some_and(|q| !q.is_empty())
    }

    /// Drop every lock `txn` holds (keys and store intents) and wake
    /// waiters.
    pub fn release_all(&self, txn: TxnId) {
        for bucket in &self.buckets {
            let mut queues = bucket.queues.lock();
            let mut touched = false;
            queues.retain(|_, queue| {
                let before = queue.len();
                queue.retain(|(t, _)| *t != txn);
                touched |= queue.len() != before;
                !queue.is_empty()
            });
            if touched {
                bucket.cond.notify_all();
            }
        }
        let mut intents = self.intents.lock();
        intents.retain(|_, held| {
            held.retain(|(t, _)| *t != txn);
            !held.is_empty()
        });
        trace!(%txn, "released all locks");
    }

    /// True when no transaction holds any lock (shutdown assertion).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.queues.lock().is_empty())
            && self.intents.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn mgr(timeout_ms: u64) -> LockManager {
        LockManager::new(LockManagerConfig {
            lock_timeout_ms: timeout_ms,
            buckets: 8,
        })
    }

    #[test]
    fn grant_and_merge() {
        let lm = mgr(100);
        let t = TxnId(1);
        assert_eq!(
            lm.acquire(t, 1, b"k", LockMode::SN, false).unwrap(),
            LockOutcome::Granted
        );
        assert_eq!(
            lm.acquire(t, 1, b"k", LockMode::NS, false).unwrap(),
            LockOutcome::Granted
        );
        assert_eq!(lm.granted_mode(t, 1, b"k"), LockMode::SS);
    }

    #[test]
    fn shared_locks_coexist() {
        let lm = mgr(100);
        lm.acquire(TxnId(1), 1, b"k", LockMode::SS, false).unwrap();
        assert_eq!(
            lm.acquire(TxnId(2), 1, b"k", LockMode::SS, false).unwrap(),
            LockOutcome::Granted
        );
    }

    #[test]
    fn latched_conflict_returns_retry() {
        let lm = mgr(100);
        lm.acquire(TxnId(1), 1, b"k", LockMode::XX, false).unwrap();
        assert_eq!(
            lm.acquire(TxnId(2), 1, b"k", LockMode::SS, true).unwrap(),
            LockOutcome::Retry
        );
    }

    #[test]
    fn younger_requester_dies() {
        let lm = mgr(1_000);
        lm.acquire(TxnId(1), 1, b"k", LockMode::XN, false).unwrap();
        let err = lm.acquire(TxnId(2), 1, b"k", LockMode::XN, false);
        assert!(matches!(err, Err(ShaleError::Deadlock { txn: 2 })));
    }

    #[test]
    fn older_requester_waits_until_release() {
        let lm = Arc::new(mgr(5_000));
        lm.acquire(TxnId(10), 1, b"k", LockMode::XN, false).unwrap();

        let lm2 = Arc::clone(&lm);
        let waiter = std::thread::spawn(move || {
            // Txn 5 is older than holder 10: it waits, then gets the lock.
            lm2.acquire(TxnId(5), 1, b"k", LockMode::XN, false)
        });
        std::thread::sleep(Duration::from_millis(50));
        lm.release_all(TxnId(10));
        assert_eq!(waiter.join().unwrap().unwrap(), LockOutcome::Granted);
    }

    #[test]
    fn older_requester_times_out() {
        let lm = mgr(50);
        lm.acquire(TxnId(10), 1, b"k", LockMode::XN, false).unwrap();
        let err = lm.acquire(TxnId(5), 1, b"k", LockMode::XN, false);
        assert!(matches!(err, Err(ShaleError::LockTimeout { .. })));
    }

    #[test]
    fn gap_only_conflicts() {
        let lm = mgr(100);
        lm.acquire(TxnId(1), 1, b"k", LockMode::NS, false).unwrap();
        // Gap-S vs gap-X conflicts even though neither locks the key.
        assert!(matches!(
            lm.acquire(TxnId(2), 1, b"k", LockMode::NX, false),
            Err(ShaleError::Deadlock { .. })
        ));
        // Key-only lock does not conflict with a gap-only lock.
        assert_eq!(
            lm.acquire(TxnId(2), 1, b"k", LockMode::SN, false).unwrap(),
            LockOutcome::Granted
        );
    }

    #[test]
    fn release_all_empties_table() {
        let lm = mgr(100);
        lm.intent_store_lock(TxnId(1), 1, IntentMode::IX);
        lm.acquire(TxnId(1), 1, b"a", LockMode::XX, false).unwrap();
        lm.acquire(TxnId(1), 1, b"b", LockMode::SS, false).unwrap();
        assert!(!lm.is_empty());
        lm.release_all(TxnId(1));
        assert!(lm.is_empty());
    }
}
