//! Quota-aware API key pool for the YouTube Data API
//!
//! Fronts a quota-limited upstream with several interchangeable API keys and
//! rotates between them as their daily budget is consumed. All shared counters
//! live behind a `StateStore`: Redis when reachable at startup, an in-process
//! map otherwise.
//!
//! Key lifecycle:
//! 1. Startup connects the store (bounded retries, then in-memory fallback)
//! 2. Pool seeds absent ledger keys and the active index
//! 3. Dispatcher attaches the active key to each upstream call
//! 4. Success → ledger increment; crossing a rotation threshold advances the key
//! 5. 403 quota/invalid-key → key marked exhausted, pool advances, call retried
//! 6. First access after Pacific midnight zeroes that key's counters

pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod policy;
pub mod pool;
pub mod quota;
pub mod reset;
pub mod store;

pub use dispatch::{DispatchSettings, Dispatcher};
pub use error::{DispatchError, Error, Result, StoreError};
pub use ledger::{LedgerEntry, QuotaLedger, Usage};
pub use policy::{ThresholdPolicy, Thresholds};
pub use pool::{Advance, KeyPool, KeyStatus, PoolSettings, PoolStatus, SelectedKey};
pub use quota::{ErrorClassification, classify_forbidden, classify_status, quota_cost};
pub use reset::{Clock, ManualClock, ResetScheduler, ZonedClock};
pub use store::{Backend, KeySpace, MemoryStore, RedisSettings, RedisStore, StateStore, connect};
