//! Oldest-active-LSN tracking for log truncation.
//!
//! Components that pin log history (the buffer pool's dirty-page rec-LSNs,
//! the transaction table's first-LSNs, the allocation cache's bitmap-page
//! LSNs) register a provider; `oldest_active()` is the min over all of
//! them. Truncation may delete partitions strictly older than that.

use parking_lot::Mutex;
use shale_types::Lsn;

type Provider = Box<dyn Fn() -> Lsn + Send + Sync>;

/// Registry of oldest-LSN providers.
#[derive(Default)]
pub struct OldestLsnTracker {
    providers: Mutex<Vec<(String, Provider)>>,
}

impl OldestLsnTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named provider. A provider returns [`Lsn::NULL`] when it
    /// currently pins nothing.
    pub fn register(&self, name: impl Into<String>, provider: impl Fn() -> Lsn + Send + Sync + 'static) {
        self.providers
            .lock()
            .push((name.into(), Box::new(provider)));
    }

    /// The minimum LSN still needed by any registered component, or
    /// [`Lsn::NULL`] when nothing is pinned.
    #[must_use]
    pub fn oldest_active(&self) -> Lsn {
        let providers = self.providers.lock();
        providers
            .iter()
            .map(|(_, p)| p())
            .filter(|lsn| !lsn.is_null())
            .min()
            .unwrap_or(Lsn::NULL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_over_providers_ignores_null() {
        let tracker = OldestLsnTracker::new();
        tracker.register("a", || Lsn::new(2, 10));
        tracker.register("b", || Lsn::NULL);
        tracker.register("c", || Lsn::new(1, 500));
        assert_eq!(tracker.oldest_active(), Lsn::new(1, 500));
    }

    #[test]
    fn empty_tracker_pins_nothing() {
        assert_eq!(OldestLsnTracker::new().oldest_active(), Lsn::NULL);
    }
}
