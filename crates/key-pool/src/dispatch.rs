//! Upstream request dispatch with key rotation
//!
//! One logical call is an explicit bounded loop of at most `max_retries + 1`
//! attempts. Each attempt re-reads the active key, so a rotation triggered by
//! a rejected key (or by a concurrent call) takes effect on the next attempt.
//!
//! Outcome per attempt:
//! - 2xx: usage recorded, payload returned
//! - 403 with a quota or invalid-key reason: key marked exhausted, pool
//!   advances, retried unless every key is now spent
//! - transport failure or any other status: retried unchanged
//!
//! Usage is only recorded after a definitive success, so a call cancelled
//! mid-flight leaves the ledger untouched.

use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::error::DispatchError;
use crate::pool::KeyPool;
use crate::quota::{classify_status, quota_cost};

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Upstream API root, e.g. `https://www.googleapis.com/youtube/v3`
    pub base_url: String,
    /// Per-attempt request timeout
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Optional random pause before each attempt, `(min, max)`
    pub jitter: Option<(Duration, Duration)>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            base_url: "https://www.googleapis.com/youtube/v3".into(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
            jitter: None,
        }
    }
}

/// Last failed attempt, kept so the terminal error can carry it.
enum Failure {
    Transport(String),
    Upstream { status: u16, body: String },
    Rejected { status: u16, body: String },
}

/// Attaches pooled keys to upstream calls.
pub struct Dispatcher {
    pool: Arc<KeyPool>,
    client: reqwest::Client,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(pool: Arc<KeyPool>, client: reqwest::Client, settings: DispatchSettings) -> Self {
        Self {
            pool,
            client,
            settings,
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// GET `path` under the base URL with `params`, returning the JSON body.
    #[instrument(skip_all, fields(path = %path))]
    pub async fn request(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, DispatchError> {
        let target = self.target_url(path, params)?;
        let cost = quota_cost(path);
        let max_attempts = self.settings.max_retries.saturating_add(1);
        let mut last_failure: Option<Failure> = None;

        for attempt in 1..=max_attempts {
            if self.pool.all_exhausted().await {
                record_attempt("exhausted");
                error!(attempt, "all API keys exhausted, not calling upstream");
                return Err(DispatchError::AllCredentialsExhausted);
            }

            let selected = self.pool.current().await;
            let mut url = target.clone();
            url.query_pairs_mut()
                .append_pair("key", selected.key.expose());

            if let Some(pause) = self.pause() {
                tokio::time::sleep(pause).await;
            }

            debug!(attempt, key_index = selected.index, cost, "dispatching upstream call");
            let response = match self
                .client
                .get(url)
                .timeout(self.settings.timeout)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    record_attempt("transport_error");
                    warn!(attempt, key_index = selected.index, error = %without_url(&e), "upstream transport error");
                    last_failure = Some(Failure::Transport(without_url(&e)));
                    continue;
                }
            };

            let status = response.status();
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    record_attempt("transport_error");
                    warn!(attempt, key_index = selected.index, error = %without_url(&e), "failed to read upstream body");
                    last_failure = Some(Failure::Transport(without_url(&e)));
                    continue;
                }
            };

            if status.is_success() {
                // The provider charged the call whether or not the body parses
                let usage = self.pool.record_usage(selected.index, cost).await;
                debug!(
                    key_index = selected.index,
                    quota_used = usage.quota_used,
                    request_count = usage.request_count,
                    "upstream call succeeded"
                );
                return match serde_json::from_str::<Value>(&body) {
                    Ok(value) => {
                        record_attempt("success");
                        Ok(value)
                    }
                    Err(e) => {
                        record_attempt("decode_error");
                        warn!(key_index = selected.index, error = %e, "upstream body is not JSON");
                        Err(DispatchError::Decode(e.to_string()))
                    }
                };
            }

            let status = status.as_u16();
            let classification = classify_status(status, &body);
            if classification.is_credential_failure() {
                record_attempt("credential_rejected");
                warn!(
                    attempt,
                    key_index = selected.index,
                    status,
                    classification = ?classification,
                    "upstream rejected API key"
                );
                let advance = self.pool.mark_exhausted(selected.index).await;
                if self.pool.all_exhausted().await {
                    error!(attempt, "no API keys left after rejection");
                    return Err(DispatchError::AllCredentialsExhausted);
                }
                info!(key_index = advance.index(), "retrying with next API key");
                last_failure = Some(Failure::Rejected { status, body });
                continue;
            }

            record_attempt("upstream_error");
            warn!(attempt, key_index = selected.index, status, "upstream returned error status");
            last_failure = Some(Failure::Upstream { status, body });
        }

        error!(attempts = max_attempts, "upstream call failed after all attempts");
        Err(match last_failure {
            Some(Failure::Transport(message)) => DispatchError::Transport {
                attempts: max_attempts,
                message,
            },
            Some(Failure::Upstream { status, body }) => DispatchError::Upstream { status, body },
            Some(Failure::Rejected { status, body }) => DispatchError::RetriesExhausted {
                attempts: max_attempts,
                last_status: Some(status),
                last_body: Some(body),
            },
            None => DispatchError::RetriesExhausted {
                attempts: max_attempts,
                last_status: None,
                last_body: None,
            },
        })
    }

    /// Base URL joined with `path`, carrying `params` but not the key.
    fn target_url(&self, path: &str, params: &[(&str, String)]) -> Result<Url, DispatchError> {
        let joined = format!(
            "{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut url = Url::parse(&joined)
            .map_err(|e| DispatchError::InvalidRequest(format!("{joined}: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            for (name, value) in params {
                query.append_pair(name, value);
            }
        }
        Ok(url)
    }

    /// Random pre-call pause, if configured.
    fn pause(&self) -> Option<Duration> {
        let (min, max) = self.settings.jitter?;
        if max.is_zero() {
            return None;
        }
        if min >= max {
            return Some(min);
        }
        let millis = rand::rng().random_range(min.as_millis()..=max.as_millis());
        Some(Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX)))
    }
}

fn record_attempt(outcome: &'static str) {
    metrics::counter!("youtube_dispatch_attempts_total", "outcome" => outcome).increment(1);
}

/// Error text with the request URL stripped, since it carries the key.
fn without_url(e: &reqwest::Error) -> String {
    let mut message = e.to_string();
    if let Some(url) = e.url() {
        message = message.replace(url.as_str(), "<upstream>");
    }
    message
}
