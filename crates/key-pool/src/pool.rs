//! Key pool: active key selection and rotation
//!
//! The pool holds the ordered API keys and owns the active index. Both the
//! index and the per-key ledger live in the `StateStore`, so every gateway
//! replica sharing a Redis database rotates the same way.
//!
//! Rotation happens in two places:
//! - after a successful call, when the key crosses a soft threshold
//! - when the provider rejects the key (quota exceeded or invalid)
//!
//! Advancing scans forward from the next index for a key still under the daily
//! cap. When every key is spent the index still moves one step, so the pool
//! keeps trying after the next reset instead of freezing on one key.

use std::sync::Arc;

use common::Secret;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::ledger::{LedgerEntry, QuotaLedger, Usage};
use crate::policy::ThresholdPolicy;
use crate::reset::Clock;
use crate::store::{Backend, KeySpace, StateStore};

/// Pool-wide tunables.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Hard daily cap per key, in quota units
    pub daily_limit: u64,
    /// Namespace for every ledger key in the store
    pub key_prefix: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            daily_limit: 10_000,
            key_prefix: "youtube_api:".into(),
        }
    }
}

/// The key chosen for one upstream attempt.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub index: usize,
    pub key: Secret<String>,
}

/// Result of advancing the active index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Moved to a key with remaining quota
    Rotated { from: usize, to: usize },
    /// No key has remaining quota; index moved one step anyway
    AllExhausted { from: usize, to: usize },
}

impl Advance {
    /// The new active index.
    pub fn index(&self) -> usize {
        match self {
            Advance::Rotated { to, .. } | Advance::AllExhausted { to, .. } => *to,
        }
    }
}

/// Snapshot for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub backend: &'static str,
    pub active_index: usize,
    pub daily_limit: u64,
    pub all_exhausted: bool,
    pub keys: Vec<KeyStatus>,
}

/// Ledger entry plus derived exhaustion flag.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    #[serde(flatten)]
    pub entry: LedgerEntry,
    pub exhausted: bool,
}

/// Ordered API keys with a shared usage ledger.
pub struct KeyPool {
    keys: Vec<Secret<String>>,
    store: Arc<dyn StateStore>,
    space: KeySpace,
    ledger: QuotaLedger,
    policy: ThresholdPolicy,
}

impl KeyPool {
    /// Build the pool and seed absent state in the store.
    ///
    /// Blank keys are dropped; an empty list after filtering is an error.
    pub async fn open(
        keys: Vec<Secret<String>>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        policy: ThresholdPolicy,
        settings: PoolSettings,
    ) -> Result<Self> {
        let keys: Vec<Secret<String>> = keys.into_iter().filter(|k| !k.is_blank()).collect();
        if keys.is_empty() {
            return Err(Error::NoKeys);
        }

        let space = KeySpace::new(settings.key_prefix);
        let ledger = QuotaLedger::new(
            store.clone(),
            space.clone(),
            clock,
            settings.daily_limit,
            keys.len(),
        );
        let pool = Self {
            keys,
            store,
            space,
            ledger,
            policy,
        };

        if !pool.store.exists(&pool.space.active_index()).await {
            pool.store.set(&pool.space.active_index(), "0".into()).await;
        }
        pool.ledger.initialize().await;
        info!(
            keys = pool.keys.len(),
            backend = pool.store.backend().label(),
            daily_limit = pool.ledger.daily_limit(),
            "key pool initialized"
        );
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn backend(&self) -> Backend {
        self.store.backend()
    }

    /// Active key after validating the index and applying any pending reset.
    pub async fn current(&self) -> SelectedKey {
        let index = self.active_index().await;
        self.ledger.maybe_reset(index).await;
        SelectedKey {
            index,
            key: self.keys[index].clone(),
        }
    }

    /// Active index, repaired to 0 when absent, corrupt or out of range.
    pub async fn active_index(&self) -> usize {
        let key = self.space.active_index();
        let raw = self.store.get(&key).await;
        match raw.as_deref().map(str::trim).map(str::parse::<usize>) {
            Some(Ok(index)) if index < self.keys.len() => index,
            other => {
                if let Some(bad) = &raw {
                    warn!(value = %bad, parsed = ?other, "invalid active key index, resetting to 0");
                }
                self.store.set(&key, "0".into()).await;
                0
            }
        }
    }

    /// Move to the next key with remaining quota.
    pub async fn advance(&self) -> Advance {
        let n = self.keys.len();
        let from = self.active_index().await;
        let limit = self.ledger.daily_limit();

        let mut candidate = (from + 1) % n;
        let mut found = None;
        for _ in 0..n {
            if self.ledger.quota_used(candidate).await < limit {
                found = Some(candidate);
                break;
            }
            candidate = (candidate + 1) % n;
        }

        let outcome = match found {
            Some(to) => Advance::Rotated { from, to },
            None => Advance::AllExhausted {
                from,
                to: (from + 1) % n,
            },
        };

        let to = outcome.index();
        if !self
            .store
            .set(&self.space.active_index(), to.to_string())
            .await
        {
            warn!(from, to, "failed to persist active key index");
        }
        metrics::gauge!("youtube_active_key_index").set(to as f64);

        match outcome {
            Advance::Rotated { .. } => info!(from, to, "rotated API key"),
            Advance::AllExhausted { .. } => {
                error!(from, to, "all API keys have exceeded their quota")
            }
        }
        outcome
    }

    /// Record a successful call and rotate when a soft threshold is crossed.
    ///
    /// Rotation only fires while `index` is still active, so a concurrent call
    /// that already rotated away is not skipped past a fresh key.
    pub async fn record_usage(&self, index: usize, cost: u64) -> Usage {
        let usage = self.ledger.increment(index, cost).await;
        if usage.is_unknown() {
            return usage;
        }

        let thresholds = self.policy.sample();
        if thresholds.should_rotate(usage, self.ledger.daily_limit())
            && self.active_index().await == index
        {
            debug!(
                key_index = index,
                quota_used = usage.quota_used,
                request_count = usage.request_count,
                fraction = thresholds.fraction,
                requests = thresholds.requests,
                "rotation threshold crossed"
            );
            metrics::counter!("youtube_key_rotations_total", "reason" => "threshold").increment(1);
            self.advance().await;
        }
        usage
    }

    /// Take a key the provider rejected out of rotation and advance.
    pub async fn mark_exhausted(&self, index: usize) -> Advance {
        self.ledger.mark_exhausted(index).await;
        metrics::counter!("youtube_key_rotations_total", "reason" => "rejected").increment(1);
        let active = self.active_index().await;
        if active != index {
            // Another call already moved on; the mark alone is enough
            return Advance::Rotated {
                from: index,
                to: active,
            };
        }
        self.advance().await
    }

    pub async fn all_exhausted(&self) -> bool {
        self.ledger.all_exhausted().await
    }

    /// Per-key ledger and pool-wide flags for the monitoring endpoint.
    pub async fn status(&self) -> PoolStatus {
        let limit = self.ledger.daily_limit();
        let mut keys = Vec::with_capacity(self.keys.len());
        for index in 0..self.keys.len() {
            let entry = self.ledger.get_entry(index).await;
            let exhausted = entry.quota_used >= limit;
            keys.push(KeyStatus { entry, exhausted });
        }
        PoolStatus {
            backend: self.store.backend().label(),
            active_index: self.active_index().await,
            daily_limit: limit,
            all_exhausted: keys.iter().all(|k| k.exhausted),
            keys,
        }
    }
}
