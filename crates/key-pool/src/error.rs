//! Error types for pool construction and dispatch

/// Errors from building the pool and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no usable API keys configured")]
    NoKeys,

    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error("invalid rotation thresholds: {0}")]
    InvalidThresholds(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to establish the durable store connection.
///
/// Only surfaces during startup; once connected, command failures are
/// absorbed by the store and never reach callers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Terminal outcome of a dispatched upstream call.
///
/// Per-attempt credential failures (quota exceeded, invalid key) never appear
/// here directly: they rotate the pool and retry. Only the reason the whole
/// call gave up is surfaced.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("all API keys have exhausted their daily quota")]
    AllCredentialsExhausted,

    #[error("upstream transport error after {attempts} attempts: {message}")]
    Transport { attempts: u32, message: String },

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error(
        "retries exhausted after {attempts} attempts{}",
        last_response(.last_status, .last_body)
    )]
    RetriesExhausted {
        attempts: u32,
        last_status: Option<u16>,
        last_body: Option<String>,
    },

    #[error("upstream returned a non-JSON body: {0}")]
    Decode(String),

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

impl DispatchError {
    /// Short label for metrics and error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::AllCredentialsExhausted => "all_credentials_exhausted",
            DispatchError::Transport { .. } => "transport_error",
            DispatchError::Upstream { .. } => "upstream_error",
            DispatchError::RetriesExhausted { .. } => "retries_exhausted",
            DispatchError::Decode(_) => "decode_error",
            DispatchError::InvalidRequest(_) => "invalid_request",
        }
    }
}

fn last_response(status: &Option<u16>, body: &Option<String>) -> String {
    match (status, body) {
        (Some(status), Some(body)) => format!(", last upstream response {status}: {body}"),
        (Some(status), None) => format!(", last upstream status {status}"),
        _ => String::new(),
    }
}
