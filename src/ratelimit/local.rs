//! In-process fallback counter store.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, trace};

use super::now_ms;

/// Chance that a hit first sweeps expired records.
const SWEEP_PROBABILITY: f64 = 0.05;

/// A fixed-window counter held in process memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    /// Requests seen in the current window
    pub count: u64,
    /// When the current window ends (epoch milliseconds)
    pub reset_at: u64,
}

impl CounterRecord {
    /// Start a new window at `now`.
    pub fn fresh(now: u64, window: Duration) -> Self {
        Self {
            count: 1,
            reset_at: now + window.as_millis() as u64,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.reset_at
    }

    /// Whole seconds until the window ends, rounded up.
    pub fn secs_until_reset(&self, now: u64) -> u64 {
        self.reset_at.saturating_sub(now).div_ceil(1000)
    }
}

/// Process-wide map from counter key to [`CounterRecord`].
///
/// Used when the distributed store is absent or failing. Counts are per
/// process, so multi-instance deployments get per-instance quotas while
/// degraded. Each hit performs its read-modify-write under the map's entry
/// lock, so concurrent requests never lose updates.
#[derive(Debug, Default)]
pub struct LocalCounterStore {
    records: DashMap<String, CounterRecord>,
}

impl LocalCounterStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Count one request against `key`, starting a new window if needed.
    pub fn hit(&self, key: &str, window: Duration) -> CounterRecord {
        if rand::random::<f64>() < SWEEP_PROBABILITY {
            self.purge_expired();
        }
        self.hit_at(key, window, now_ms())
    }

    pub(crate) fn hit_at(&self, key: &str, window: Duration, now: u64) -> CounterRecord {
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.is_expired(now) {
                    trace!(key = %key, "Window elapsed, starting a new one");
                    *record = CounterRecord::fresh(now, window);
                } else {
                    record.count += 1;
                }
                *record
            }
            Entry::Vacant(vacant) => {
                debug!(key = %key, window_ms = window.as_millis() as u64, "Creating local counter");
                *vacant.insert(CounterRecord::fresh(now, window))
            }
        }
    }

    /// Current record for `key`, expired or not.
    pub fn get(&self, key: &str) -> Option<CounterRecord> {
        self.records.get(key).map(|r| *r)
    }

    /// Overwrite the record for `key`.
    pub fn set(&self, key: &str, record: CounterRecord) {
        self.records.insert(key.to_string(), record);
    }

    /// The live record for `key`, without counting a request.
    pub fn peek(&self, key: &str) -> Option<CounterRecord> {
        self.peek_at(key, now_ms())
    }

    pub(crate) fn peek_at(&self, key: &str, now: u64) -> Option<CounterRecord> {
        self.get(key).filter(|r| !r.is_expired(now))
    }

    /// Drop every record whose window has ended. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(now_ms())
    }

    pub(crate) fn purge_expired_at(&self, now: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(removed, remaining = self.records.len(), "Purged expired local counters");
        }
        removed
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Clear all counters.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_millis(1000);

    #[test]
    fn test_first_hit_creates_record() {
        let store = LocalCounterStore::new();
        let record = store.hit_at("k", WINDOW, 10_000);

        assert_eq!(record, CounterRecord { count: 1, reset_at: 11_000 });
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_hits_within_window_increment() {
        let store = LocalCounterStore::new();
        store.hit_at("k", WINDOW, 10_000);
        store.hit_at("k", WINDOW, 10_200);
        let record = store.hit_at("k", WINDOW, 10_999);

        assert_eq!(record.count, 3);
        // The window is anchored on the first hit
        assert_eq!(record.reset_at, 11_000);
    }

    #[test]
    fn test_hit_after_window_resets() {
        let store = LocalCounterStore::new();
        store.hit_at("k", WINDOW, 10_000);
        store.hit_at("k", WINDOW, 10_500);

        let record = store.hit_at("k", WINDOW, 11_000);
        assert_eq!(record, CounterRecord { count: 1, reset_at: 12_000 });
    }

    #[test]
    fn test_peek_does_not_mutate() {
        let store = LocalCounterStore::new();
        assert_eq!(store.peek_at("k", 10_000), None);

        store.hit_at("k", WINDOW, 10_000);
        assert_eq!(store.peek_at("k", 10_100).map(|r| r.count), Some(1));
        assert_eq!(store.peek_at("k", 10_100).map(|r| r.count), Some(1));

        // Expired records are invisible to peek but still stored
        assert_eq!(store.peek_at("k", 11_000), None);
        assert!(store.get("k").is_some());
    }

    #[test]
    fn test_set_and_get() {
        let store = LocalCounterStore::new();
        let record = CounterRecord { count: 7, reset_at: 99 };
        store.set("k", record);
        assert_eq!(store.get("k"), Some(record));
    }

    #[test]
    fn test_purge_expired() {
        let store = LocalCounterStore::new();
        store.hit_at("old", WINDOW, 1_000);
        store.hit_at("new", WINDOW, 5_000);

        assert_eq!(store.purge_expired_at(5_500), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("new").is_some());
        assert!(store.get("old").is_none());
    }

    #[test]
    fn test_secs_until_reset_rounds_up() {
        let record = CounterRecord { count: 1, reset_at: 10_001 };
        assert_eq!(record.secs_until_reset(9_000), 2);
        assert_eq!(record.secs_until_reset(10_001), 0);
        assert_eq!(record.secs_until_reset(20_000), 0);
    }

    #[test]
    fn test_concurrent_hits_are_not_lost() {
        let store = Arc::new(LocalCounterStore::new());
        let window = Duration::from_secs(60);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        store.hit("shared", window);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get("shared").unwrap().count, 2000);
    }
}
