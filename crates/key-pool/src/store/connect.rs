//! Startup connection to the durable store with in-memory fallback
//!
//! Pure state machine: receives events, returns (new_state, action).
//! `connect()` executes the I/O implied by each action.
//!
//! Attempts are bounded by `connect_attempts` with a fixed `connect_delay`
//! between them. Exhausting the budget is a one-way transition to the
//! in-memory store for the rest of the process lifetime.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{MemoryStore, RedisSettings, RedisStore, StateStore};

/// Connection states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectState {
    /// Attempt number `attempt` (1-based) in flight
    Connecting { attempt: u32 },
    /// Attempt `attempt` failed, waiting before the next one
    Waiting { attempt: u32 },
    /// Durable store reachable
    Connected,
    /// Budget exhausted, running on in-process counters
    Fallback,
}

/// Events that drive state transitions.
#[derive(Debug)]
pub enum ConnectEvent {
    /// Connect + ping succeeded
    Connected,
    /// Connect or ping failed
    Failed(String),
    /// Inter-attempt delay elapsed
    DelayElapsed,
}

/// Actions the caller should execute after a transition.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectAction {
    Attempt { attempt: u32 },
    Sleep { delay: Duration },
    UseDurable,
    UseFallback,
    None,
}

/// Initial state and action.
pub fn start() -> (ConnectState, ConnectAction) {
    (
        ConnectState::Connecting { attempt: 1 },
        ConnectAction::Attempt { attempt: 1 },
    )
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    state: ConnectState,
    event: ConnectEvent,
    max_attempts: u32,
    delay: Duration,
) -> (ConnectState, ConnectAction) {
    match (state, event) {
        (ConnectState::Connecting { .. }, ConnectEvent::Connected) => {
            (ConnectState::Connected, ConnectAction::UseDurable)
        }

        (ConnectState::Connecting { attempt }, ConnectEvent::Failed(_)) if attempt < max_attempts => (
            ConnectState::Waiting { attempt },
            ConnectAction::Sleep { delay },
        ),

        (ConnectState::Connecting { .. }, ConnectEvent::Failed(_)) => {
            (ConnectState::Fallback, ConnectAction::UseFallback)
        }

        (ConnectState::Waiting { attempt }, ConnectEvent::DelayElapsed) => (
            ConnectState::Connecting {
                attempt: attempt + 1,
            },
            ConnectAction::Attempt {
                attempt: attempt + 1,
            },
        ),

        // Terminal states ignore further events
        (state, _event) => (state, ConnectAction::None),
    }
}

/// Connect to Redis, falling back to an in-memory store when unreachable.
///
/// A `connect_attempts` of zero skips the durable store entirely.
pub async fn connect(settings: &RedisSettings) -> Arc<dyn StateStore> {
    if settings.connect_attempts == 0 {
        warn!("durable store disabled, using in-memory counters");
        return Arc::new(MemoryStore::new());
    }

    let (mut state, mut action) = start();
    let mut durable: Option<RedisStore> = None;

    loop {
        let event = match action {
            ConnectAction::Attempt { attempt } => {
                info!(
                    endpoint = %settings.endpoint(),
                    attempt,
                    max_attempts = settings.connect_attempts,
                    "connecting to redis"
                );
                match RedisStore::connect(settings).await {
                    Ok(store) => {
                        durable = Some(store);
                        ConnectEvent::Connected
                    }
                    Err(e) => {
                        warn!(
                            endpoint = %settings.endpoint(),
                            attempt,
                            error = %e,
                            "redis connection failed"
                        );
                        ConnectEvent::Failed(e.to_string())
                    }
                }
            }
            ConnectAction::Sleep { delay } => {
                tokio::time::sleep(delay).await;
                ConnectEvent::DelayElapsed
            }
            ConnectAction::UseDurable => {
                if let Some(store) = durable.take() {
                    return Arc::new(store);
                }
                // Connected without a handle cannot happen; treat as fallback
                break;
            }
            ConnectAction::UseFallback | ConnectAction::None => break,
        };

        (state, action) = handle_event(
            state,
            event,
            settings.connect_attempts,
            settings.connect_delay,
        );
    }

    warn!(
        endpoint = %settings.endpoint(),
        attempts = settings.connect_attempts,
        ?state,
        "redis unreachable, running in degraded mode with in-memory counters until restart"
    );
    Arc::new(MemoryStore::new())
}
