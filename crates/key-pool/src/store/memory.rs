//! In-process fallback store
//!
//! Same semantics as the Redis backend, minus persistence. Each operation runs
//! inside one critical section of a tokio `Mutex`, so increments from
//! concurrent dispatches never lose updates.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::warn;

use super::{Backend, Rollover, StateStore, StoreFuture};

/// Mutex-guarded key/value map.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { self.values.lock().await.get(key).cloned() })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.values.lock().await.insert(key.to_string(), value);
            true
        })
    }

    fn increment<'a>(&'a self, key: &'a str, by: i64) -> StoreFuture<'a, Option<i64>> {
        Box::pin(async move {
            let mut values = self.values.lock().await;
            let current = match values.get(key) {
                Some(raw) => match raw.parse::<i64>() {
                    Ok(n) => n,
                    Err(_) => {
                        warn!(key, "stored value is not an integer, refusing to increment");
                        return None;
                    }
                },
                None => 0,
            };
            let next = current.checked_add(by)?;
            values.insert(key.to_string(), next.to_string());
            Some(next)
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { self.values.lock().await.contains_key(key) })
    }

    fn rollover<'a>(
        &'a self,
        date_key: &'a str,
        date: &'a str,
        counters: &'a [String],
    ) -> StoreFuture<'a, Rollover> {
        Box::pin(async move {
            let mut values = self.values.lock().await;
            if values.get(date_key).map(String::as_str) == Some(date) {
                return Rollover::Current;
            }
            for counter in counters {
                values.insert(counter.clone(), "0".to_string());
            }
            let previous = values.insert(date_key.to_string(), date.to_string());
            Rollover::Reset { previous }
        })
    }
}
