//! Key-range (OKVL-style) locking for shale.
//!
//! A lock id is `(store, key bytes)`. Each lock has two element modes: the
//! *key* part protects the key value itself, the *gap* part protects the
//! open interval below the next key — which is what gives cursors phantom
//! protection. The familiar pair names: `SS` (key S + gap S), `SN`, `NS`,
//! `XX`, `XN`, `NX`, and `NN` (no lock at all).
//!
//! The table's contract with callers mirrors the cursor discipline: a
//! conflicting request made *while the caller holds a page latch* returns
//! [`LockOutcome::Retry`] instead of blocking — the caller must unfix,
//! re-acquire blocking, and re-validate the page. Blocking waits are
//! bounded by a timeout, and wait-die victimization resolves deadlocks: a
//! requester younger than a conflicting holder is killed immediately.

pub mod okvl;
pub mod table;

pub use okvl::{IntentMode, LockBase, LockMode};
pub use table::{LockManager, LockManagerConfig, LockOutcome};
