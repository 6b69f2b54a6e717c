//! Per-key usage ledger
//!
//! Tracks quota units and request counts for each key index on top of a
//! `StateStore`. Every read or write touching an index runs the reset check
//! first, so counters always describe the current quota day.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::reset::{Clock, ResetScheduler};
use crate::store::{KeySpace, StateStore};

/// Snapshot of one key's ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub index: usize,
    pub quota_used: u64,
    pub request_count: u64,
    pub last_reset_date: Option<String>,
}

/// Post-increment counters for one key.
///
/// Both fields are 0 when the store failed: callers treat that as "unknown"
/// and skip threshold-based rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub quota_used: u64,
    pub request_count: u64,
}

impl Usage {
    pub fn is_unknown(&self) -> bool {
        self.quota_used == 0 && self.request_count == 0
    }
}

/// Usage counters for a fixed number of keys.
pub struct QuotaLedger {
    store: Arc<dyn StateStore>,
    keys: KeySpace,
    scheduler: ResetScheduler,
    daily_limit: u64,
    size: usize,
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn StateStore>,
        keys: KeySpace,
        clock: Arc<dyn Clock>,
        daily_limit: u64,
        size: usize,
    ) -> Self {
        let scheduler = ResetScheduler::new(store.clone(), keys.clone(), clock);
        Self {
            store,
            keys,
            scheduler,
            daily_limit,
            size,
        }
    }

    /// Hard daily cap per key.
    pub fn daily_limit(&self) -> u64 {
        self.daily_limit
    }

    /// Number of keys tracked.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Seed absent counters and dates. Existing values are left alone so a
    /// durable store keeps its state across restarts.
    pub async fn initialize(&self) {
        let today = self.scheduler.today();
        for index in 0..self.size {
            for (key, value) in [
                (self.keys.quota(index), "0".to_string()),
                (self.keys.requests(index), "0".to_string()),
                (self.keys.last_reset_date(index), today.clone()),
            ] {
                if !self.store.exists(&key).await {
                    self.store.set(&key, value).await;
                }
            }
        }
        info!(keys = self.size, date = %today, "ledger initialized");
    }

    /// Run the daily reset check for one index.
    pub async fn maybe_reset(&self, index: usize) -> bool {
        self.scheduler.maybe_reset(index).await
    }

    /// Current entry for `index`, after any pending reset.
    pub async fn get_entry(&self, index: usize) -> LedgerEntry {
        self.maybe_reset(index).await;
        LedgerEntry {
            index,
            quota_used: self.read_counter(&self.keys.quota(index)).await,
            request_count: self.read_counter(&self.keys.requests(index)).await,
            last_reset_date: self.store.get(&self.keys.last_reset_date(index)).await,
        }
    }

    /// Quota units used today by `index`, after any pending reset.
    pub async fn quota_used(&self, index: usize) -> u64 {
        self.maybe_reset(index).await;
        self.read_counter(&self.keys.quota(index)).await
    }

    /// Charge `cost` units and one request to `index`.
    ///
    /// Returns the post-increment counters, or zeros when the store failed.
    pub async fn increment(&self, index: usize, cost: u64) -> Usage {
        self.maybe_reset(index).await;

        let by = i64::try_from(cost).unwrap_or(i64::MAX);
        let Some(quota_used) = self.store.increment(&self.keys.quota(index), by).await else {
            warn!(key_index = index, cost, "failed to record quota usage");
            return Usage::default();
        };
        let Some(request_count) = self.store.increment(&self.keys.requests(index), 1).await else {
            warn!(key_index = index, "failed to record request count");
            return Usage::default();
        };

        let usage = Usage {
            quota_used: clamp_counter(quota_used),
            request_count: clamp_counter(request_count),
        };
        debug!(
            key_index = index,
            request = usage.request_count,
            quota_used = usage.quota_used,
            daily_limit = self.daily_limit,
            "recorded usage"
        );
        metrics::counter!("youtube_quota_units_total", "key_index" => index.to_string())
            .increment(cost);
        usage
    }

    /// Force `index` to the daily cap.
    ///
    /// Used when the provider reports the key as over quota or unusable; its
    /// verdict overrides local bookkeeping until the next reset boundary.
    pub async fn mark_exhausted(&self, index: usize) {
        self.maybe_reset(index).await;
        if !self
            .store
            .set(&self.keys.quota(index), self.daily_limit.to_string())
            .await
        {
            warn!(key_index = index, "failed to mark key exhausted");
            return;
        }
        warn!(key_index = index, "key marked as quota exceeded");
    }

    /// True iff every key is at or over the cap for the current day.
    pub async fn all_exhausted(&self) -> bool {
        for index in 0..self.size {
            if self.quota_used(index).await < self.daily_limit {
                return false;
            }
        }
        true
    }

    async fn read_counter(&self, key: &str) -> u64 {
        match self.store.get(key).await {
            Some(raw) => raw.trim().parse::<i64>().map(clamp_counter).unwrap_or(0),
            None => 0,
        }
    }
}

fn clamp_counter(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reset::ManualClock;
    use crate::store::{Backend, MemoryStore, Rollover, StoreFuture};
    use std::time::Duration;

    fn ledger(size: usize, daily_limit: u64) -> (QuotaLedger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new("2025-06-01"));
        let ledger = QuotaLedger::new(
            Arc::new(MemoryStore::new()),
            KeySpace::default(),
            clock.clone(),
            daily_limit,
            size,
        );
        (ledger, clock)
    }

    /// Store whose backend is permanently unreachable.
    struct DownStore;

    impl StateStore for DownStore {
        fn backend(&self) -> Backend {
            Backend::Redis
        }
        fn get<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, Option<String>> {
            Box::pin(async { None })
        }
        fn set<'a>(&'a self, _key: &'a str, _value: String) -> StoreFuture<'a, bool> {
            Box::pin(async { false })
        }
        fn increment<'a>(&'a self, _key: &'a str, _by: i64) -> StoreFuture<'a, Option<i64>> {
            Box::pin(async { None })
        }
        fn exists<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, bool> {
            Box::pin(async { false })
        }
        fn rollover<'a>(
            &'a self,
            _date_key: &'a str,
            _date: &'a str,
            _counters: &'a [String],
        ) -> StoreFuture<'a, Rollover> {
            Box::pin(async { Rollover::Unavailable })
        }
    }

    /// Memory store whose rollover returns late, widening the window between
    /// the reset and the caller's own increment.
    struct SlowRollover {
        inner: MemoryStore,
        delay: Duration,
    }

    impl StateStore for SlowRollover {
        fn backend(&self) -> Backend {
            Backend::Memory
        }
        fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
            self.inner.get(key)
        }
        fn set<'a>(&'a self, key: &'a str, value: String) -> StoreFuture<'a, bool> {
            self.inner.set(key, value)
        }
        fn increment<'a>(&'a self, key: &'a str, by: i64) -> StoreFuture<'a, Option<i64>> {
            self.inner.increment(key, by)
        }
        fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
            self.inner.exists(key)
        }
        fn rollover<'a>(
            &'a self,
            date_key: &'a str,
            date: &'a str,
            counters: &'a [String],
        ) -> StoreFuture<'a, Rollover> {
            Box::pin(async move {
                let outcome = self.inner.rollover(date_key, date, counters).await;
                tokio::time::sleep(self.delay).await;
                outcome
            })
        }
    }

    #[tokio::test]
    async fn initialize_seeds_absent_entries() {
        let (ledger, _clock) = ledger(3, 10_000);
        ledger.initialize().await;

        for index in 0..3 {
            let entry = ledger.get_entry(index).await;
            assert_eq!(entry.quota_used, 0);
            assert_eq!(entry.request_count, 0);
            assert_eq!(entry.last_reset_date.as_deref(), Some("2025-06-01"));
        }
    }

    #[tokio::test]
    async fn initialize_preserves_existing_counters() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new("2025-06-01"));
        store.set("youtube_api:quota:0", "4200".into()).await;
        store
            .set("youtube_api:last_reset_date:0", "2025-06-01".into())
            .await;

        let ledger = QuotaLedger::new(store, KeySpace::default(), clock, 10_000, 1);
        ledger.initialize().await;
        assert_eq!(ledger.quota_used(0).await, 4200);
    }

    #[tokio::test]
    async fn increment_sums_costs_since_reset() {
        let (ledger, _clock) = ledger(2, 10_000);
        ledger.initialize().await;

        let costs = [100u64, 1, 1, 100, 1];
        let mut last = Usage::default();
        for cost in costs {
            last = ledger.increment(1, cost).await;
        }
        assert_eq!(last.quota_used, costs.iter().sum::<u64>());
        assert_eq!(last.request_count, costs.len() as u64);
        // Other keys untouched
        assert_eq!(ledger.quota_used(0).await, 0);
    }

    #[tokio::test]
    async fn increment_is_monotonic_within_a_day() {
        let (ledger, _clock) = ledger(1, 10_000);
        let mut previous = 0;
        for _ in 0..20 {
            let usage = ledger.increment(0, 7).await;
            assert!(usage.quota_used > previous);
            previous = usage.quota_used;
        }
    }

    #[tokio::test]
    async fn increment_after_boundary_starts_from_zero() {
        let (ledger, clock) = ledger(1, 10_000);
        ledger.initialize().await;
        ledger.increment(0, 100).await;
        ledger.increment(0, 100).await;

        clock.set("2025-06-02");
        let usage = ledger.increment(0, 1).await;
        assert_eq!(usage.quota_used, 1);
        assert_eq!(usage.request_count, 1);

        let entry = ledger.get_entry(0).await;
        assert_eq!(entry.last_reset_date.as_deref(), Some("2025-06-02"));
    }

    #[tokio::test]
    async fn counters_are_zero_right_after_boundary() {
        let (ledger, clock) = ledger(1, 10_000);
        ledger.initialize().await;
        ledger.increment(0, 500).await;

        clock.set("2025-06-02");
        let entry = ledger.get_entry(0).await;
        assert_eq!(entry.quota_used, 0);
        assert_eq!(entry.request_count, 0);
    }

    #[tokio::test]
    async fn mark_exhausted_sets_cap() {
        let (ledger, _clock) = ledger(2, 10_000);
        ledger.initialize().await;
        ledger.increment(0, 1).await;

        ledger.mark_exhausted(0).await;
        assert_eq!(ledger.quota_used(0).await, 10_000);
    }

    #[tokio::test]
    async fn all_exhausted_requires_every_key() {
        let (ledger, _clock) = ledger(2, 10_000);
        ledger.initialize().await;

        ledger.mark_exhausted(0).await;
        assert!(!ledger.all_exhausted().await);

        ledger.mark_exhausted(1).await;
        assert!(ledger.all_exhausted().await);
    }

    #[tokio::test]
    async fn all_exhausted_applies_pending_resets() {
        let (ledger, clock) = ledger(2, 10_000);
        ledger.initialize().await;
        ledger.mark_exhausted(0).await;
        ledger.mark_exhausted(1).await;
        assert!(ledger.all_exhausted().await);

        clock.set("2025-06-02");
        assert!(!ledger.all_exhausted().await);
    }

    #[tokio::test]
    async fn usage_over_cap_counts_as_exhausted() {
        let (ledger, _clock) = ledger(1, 100);
        ledger.increment(0, 100).await;
        assert!(ledger.all_exhausted().await);
    }

    #[tokio::test]
    async fn failed_store_increment_returns_zero() {
        let clock = Arc::new(ManualClock::new("2025-06-01"));
        let ledger = QuotaLedger::new(Arc::new(DownStore), KeySpace::default(), clock, 10_000, 2);

        let usage = ledger.increment(0, 100).await;
        assert_eq!(usage, Usage::default());
        assert!(usage.is_unknown());
        // Degraded reads report unused keys rather than failing
        assert!(!ledger.all_exhausted().await);
    }

    #[tokio::test(start_paused = true)]
    async fn increment_during_slow_reset_is_kept() {
        let clock = Arc::new(ManualClock::new("2025-06-01"));
        let store = Arc::new(SlowRollover {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(100),
        });
        let ledger = Arc::new(QuotaLedger::new(
            store,
            KeySpace::default(),
            clock.clone(),
            10_000,
            1,
        ));
        ledger.initialize().await;
        ledger.increment(0, 500).await;

        clock.set("2025-06-02");
        let first = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.increment(0, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.increment(0, 100).await })
        };

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        // Neither caller sees yesterday's 500
        assert!(first.quota_used <= 101, "got: {first:?}");
        assert!(second.quota_used <= 101, "got: {second:?}");

        let entry = ledger.get_entry(0).await;
        assert_eq!(entry.quota_used, 101);
        assert_eq!(entry.request_count, 2);
        assert_eq!(entry.last_reset_date.as_deref(), Some("2025-06-02"));
    }
}
