//! Daily quota reset at the provider's midnight
//!
//! YouTube resets key quotas at midnight Pacific time, so "today" is a
//! calendar date in a fixed reference zone rather than UTC or host-local time.
//! Resets are lazy: the first ledger access for a key after the boundary zeroes
//! its counters before proceeding. There is no background timer.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::store::{KeySpace, Rollover, StateStore};

/// Source of the current quota date (`YYYY-MM-DD`).
pub trait Clock: Send + Sync {
    fn today(&self) -> String;
}

/// Wall clock projected into a reference timezone.
#[derive(Debug, Clone, Copy)]
pub struct ZonedClock {
    tz: Tz,
}

impl ZonedClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Build from an IANA zone name such as `America/Los_Angeles`.
    pub fn from_name(name: &str) -> Result<Self> {
        let tz: Tz = name
            .parse()
            .map_err(|_| Error::InvalidTimezone(name.to_string()))?;
        Ok(Self::new(tz))
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }
}

impl Default for ZonedClock {
    fn default() -> Self {
        Self::new(chrono_tz::America::Los_Angeles)
    }
}

impl Clock for ZonedClock {
    fn today(&self) -> String {
        Utc::now()
            .with_timezone(&self.tz)
            .format("%Y-%m-%d")
            .to_string()
    }
}

/// Clock with a settable date, for tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock {
    date: Mutex<String>,
}

impl ManualClock {
    pub fn new(date: impl Into<String>) -> Self {
        Self {
            date: Mutex::new(date.into()),
        }
    }

    pub fn set(&self, date: impl Into<String>) {
        let mut guard = self.date.lock().unwrap_or_else(|e| e.into_inner());
        *guard = date.into();
    }
}

impl Clock for ManualClock {
    fn today(&self) -> String {
        self.date.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Zeroes a key's counters the first time it is touched on a new quota day.
#[derive(Clone)]
pub struct ResetScheduler {
    store: Arc<dyn StateStore>,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
}

impl ResetScheduler {
    pub fn new(store: Arc<dyn StateStore>, keys: KeySpace, clock: Arc<dyn Clock>) -> Self {
        Self { store, keys, clock }
    }

    pub fn today(&self) -> String {
        self.clock.today()
    }

    /// Reset counters for `index` if its stored date is not today.
    ///
    /// Fast path is a single read. On a stale or missing date the store
    /// zeroes the counters and moves the date in one atomic step, so an
    /// increment that sees today's date can never be wiped by a late reset
    /// and concurrent first-accesses reset at most once.
    /// Returns true when this call performed the reset.
    pub async fn maybe_reset(&self, index: usize) -> bool {
        let today = self.clock.today();
        let date_key = self.keys.last_reset_date(index);

        if self.store.get(&date_key).await.as_deref() == Some(today.as_str()) {
            return false;
        }

        let counters = [self.keys.quota(index), self.keys.requests(index)];
        match self.store.rollover(&date_key, &today, &counters).await {
            Rollover::Reset { previous } => {
                info!(
                    key_index = index,
                    previous_date = previous.as_deref().unwrap_or("none"),
                    date = %today,
                    "reset daily quota"
                );
                true
            }
            // Another caller crossed the boundary first
            Rollover::Current => false,
            Rollover::Unavailable => {
                warn!(key_index = index, date = %today, "daily reset check failed");
                false
            }
        }
    }
}
