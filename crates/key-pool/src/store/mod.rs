//! Keyed counter storage backing the ledger and the active key index
//!
//! `StateStore` is the only way pool state is read or written. Two backends
//! implement it: `RedisStore` (durable, shared across replicas) and
//! `MemoryStore` (process lifetime only). Operations never return errors;
//! a failing backend degrades to `None`/`false` and logs, so a store outage
//! costs bookkeeping accuracy rather than availability.

pub mod connect;
pub mod durable;
pub mod memory;

pub use connect::{ConnectAction, ConnectEvent, ConnectState, connect, handle_event};
pub use durable::{RedisSettings, RedisStore};
pub use memory::MemoryStore;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store operations.
///
/// Uses `Pin<Box<dyn Future>>` so the pool can hold an `Arc<dyn StateStore>`.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which backend a store is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Redis,
    Memory,
}

impl Backend {
    /// Label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            Backend::Redis => "redis",
            Backend::Memory => "memory",
        }
    }
}

/// Capability set shared by the durable and in-memory backends.
pub trait StateStore: Send + Sync {
    fn backend(&self) -> Backend;

    /// Current value, or `None` when absent or the backend failed.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Overwrite a value. Returns false when the backend failed.
    fn set<'a>(&'a self, key: &'a str, value: String) -> StoreFuture<'a, bool>;

    /// Atomically add `by` to an integer value (absent counts as 0) and
    /// return the new value. `None` when the backend failed or the stored
    /// value is not an integer.
    fn increment<'a>(&'a self, key: &'a str, by: i64) -> StoreFuture<'a, Option<i64>>;

    /// Whether the key exists. False when the backend failed.
    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Move `date_key` to `date`, zeroing `counters` in the same atomic step
    /// when the stored date differs. An increment that observes the new date
    /// always lands on the zeroed counters.
    fn rollover<'a>(
        &'a self,
        date_key: &'a str,
        date: &'a str,
        counters: &'a [String],
    ) -> StoreFuture<'a, Rollover>;
}

/// Outcome of a `rollover`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rollover {
    /// Date was already current; counters untouched.
    Current,
    /// Counters zeroed. Carries the replaced date, if any.
    Reset { previous: Option<String> },
    /// Backend failed; nothing is known about the stored state.
    Unavailable,
}

/// Key layout for pool state, scoped by a namespace prefix.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn active_index(&self) -> String {
        format!("{}current_key_index", self.prefix)
    }

    pub fn quota(&self, index: usize) -> String {
        format!("{}quota:{index}", self.prefix)
    }

    pub fn requests(&self, index: usize) -> String {
        format!("{}requests:{index}", self.prefix)
    }

    pub fn last_reset_date(&self, index: usize) -> String {
        format!("{}last_reset_date:{index}", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("youtube_api:")
    }
}
