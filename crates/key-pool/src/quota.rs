//! Quota cost table and upstream error classification for the YouTube Data API
//!
//! A 403 from YouTube carries a machine-readable reason in
//! `error.errors[].reason`. Quota reasons mean the key is spent for the day;
//! key-validity reasons mean it will never work. Both take the key out of
//! rotation. Any other failure is retried without touching the pool.

use serde_json::Value;

/// Classification of upstream errors to determine retry/rotation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Retry as-is (timeouts, 5xx, unrelated 4xx)
    Transient,
    /// Daily quota spent on this key, rotate to the next one
    QuotaExceeded,
    /// Key invalid or API not enabled for its project, rotate away
    Permanent,
}

impl ErrorClassification {
    /// Whether this outcome should take the key out of rotation.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            ErrorClassification::QuotaExceeded | ErrorClassification::Permanent
        )
    }
}

/// Reasons meaning the key's daily budget is gone.
const QUOTA_REASONS: &[&str] = &["quotaExceeded", "dailyLimitExceeded", "dailyLimitExceededUnreg"];

/// Reasons meaning the key itself is unusable.
const INVALID_KEY_REASONS: &[&str] = &[
    "keyInvalid",
    "keyExpired",
    "accessNotConfigured",
    "API_KEY_INVALID",
    "API_KEY_SERVICE_BLOCKED",
    "SERVICE_DISABLED",
];

/// Declared quota cost per upstream path, first substring match wins.
const QUOTA_COSTS: &[(&str, u64)] = &[
    ("search", 100),
    ("videos", 1),
    ("channels", 1),
    ("playlistItems", 1),
    ("playlists", 1),
];

/// Cost charged when a path matches no entry.
pub const DEFAULT_QUOTA_COST: u64 = 1;

/// Quota units charged for a call to `path`.
pub fn quota_cost(path: &str) -> u64 {
    QUOTA_COSTS
        .iter()
        .find(|(fragment, _)| path.contains(fragment))
        .map(|(_, cost)| *cost)
        .unwrap_or(DEFAULT_QUOTA_COST)
}

/// Classify a 403 response body.
///
/// Reads reasons from the structured error body; falls back to a substring
/// scan when the body is not the expected JSON shape.
pub fn classify_forbidden(body: &str) -> ErrorClassification {
    let reasons = match serde_json::from_str::<Value>(body) {
        Ok(json) => error_reasons(&json),
        Err(_) => Vec::new(),
    };

    if reasons.is_empty() {
        return classify_by_substring(body);
    }
    if reasons.iter().any(|r| QUOTA_REASONS.contains(&r.as_str())) {
        return ErrorClassification::QuotaExceeded;
    }
    if reasons
        .iter()
        .any(|r| INVALID_KEY_REASONS.contains(&r.as_str()))
    {
        return ErrorClassification::Permanent;
    }
    ErrorClassification::Transient
}

/// Classify an upstream error by HTTP status and response body.
///
/// Only 403 can implicate the key. Everything else is a generic failure,
/// retried against the same pool state.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        403 => classify_forbidden(body),
        _ => ErrorClassification::Transient,
    }
}

/// Collect `reason` strings from `error.errors[]` and `error.details[]`.
fn error_reasons(json: &Value) -> Vec<String> {
    let Some(error) = json.get("error") else {
        return Vec::new();
    };
    ["errors", "details"]
        .iter()
        .filter_map(|field| error.get(field).and_then(Value::as_array))
        .flatten()
        .filter_map(|item| item.get("reason").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn classify_by_substring(body: &str) -> ErrorClassification {
    if QUOTA_REASONS.iter().any(|r| body.contains(r)) {
        ErrorClassification::QuotaExceeded
    } else if INVALID_KEY_REASONS.iter().any(|r| body.contains(r)) {
        ErrorClassification::Permanent
    } else {
        ErrorClassification::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn youtube_error(code: u16, reason: &str) -> String {
        serde_json::json!({
            "error": {
                "code": code,
                "message": "request failed",
                "errors": [{"message": "request failed", "domain": "youtube.quota", "reason": reason}]
            }
        })
        .to_string()
    }

    #[test]
    fn cost_table() {
        assert_eq!(quota_cost("search"), 100);
        assert_eq!(quota_cost("https://www.googleapis.com/youtube/v3/search"), 100);
        assert_eq!(quota_cost("videos"), 1);
        assert_eq!(quota_cost("channels"), 1);
        assert_eq!(quota_cost("playlistItems"), 1);
        assert_eq!(quota_cost("playlists"), 1);
        assert_eq!(quota_cost("commentThreads"), DEFAULT_QUOTA_COST);
    }

    #[test]
    fn forbidden_quota_exceeded() {
        let body = youtube_error(403, "quotaExceeded");
        assert_eq!(classify_forbidden(&body), ErrorClassification::QuotaExceeded);
    }

    #[test]
    fn forbidden_daily_limit_exceeded() {
        let body = youtube_error(403, "dailyLimitExceeded");
        assert_eq!(classify_forbidden(&body), ErrorClassification::QuotaExceeded);
    }

    #[test]
    fn forbidden_access_not_configured_is_permanent() {
        let body = youtube_error(403, "accessNotConfigured");
        assert_eq!(classify_forbidden(&body), ErrorClassification::Permanent);
    }

    #[test]
    fn forbidden_key_invalid_is_permanent() {
        let body = youtube_error(403, "keyInvalid");
        assert_eq!(classify_forbidden(&body), ErrorClassification::Permanent);
    }

    #[test]
    fn forbidden_details_reason_is_read() {
        let body = serde_json::json!({
            "error": {
                "code": 403,
                "details": [{"@type": "type.googleapis.com/google.rpc.ErrorInfo", "reason": "SERVICE_DISABLED"}]
            }
        })
        .to_string();
        assert_eq!(classify_forbidden(&body), ErrorClassification::Permanent);
    }

    #[test]
    fn forbidden_unrelated_reason_is_transient() {
        // e.g. comments disabled on a video, nothing wrong with the key
        let body = youtube_error(403, "commentsDisabled");
        assert_eq!(classify_forbidden(&body), ErrorClassification::Transient);
    }

    #[test]
    fn forbidden_plain_text_falls_back_to_substring() {
        assert_eq!(
            classify_forbidden("quotaExceeded: The request cannot be completed"),
            ErrorClassification::QuotaExceeded
        );
        assert_eq!(classify_forbidden("forbidden"), ErrorClassification::Transient);
        assert_eq!(classify_forbidden(""), ErrorClassification::Transient);
    }

    #[test]
    fn status_403_delegates() {
        let body = youtube_error(403, "quotaExceeded");
        assert_eq!(classify_status(403, &body), ErrorClassification::QuotaExceeded);
    }

    #[test]
    fn non_forbidden_statuses_ignore_reason() {
        // Reasons only implicate the key on a 403
        let body = youtube_error(400, "keyInvalid");
        assert_eq!(classify_status(400, &body), ErrorClassification::Transient);
    }

    #[test]
    fn other_statuses_are_transient() {
        let body = youtube_error(404, "videoNotFound");
        assert_eq!(classify_status(404, &body), ErrorClassification::Transient);
        assert_eq!(classify_status(500, "backend error"), ErrorClassification::Transient);
        assert_eq!(classify_status(503, ""), ErrorClassification::Transient);
    }

    #[test]
    fn credential_failure_flag() {
        assert!(ErrorClassification::QuotaExceeded.is_credential_failure());
        assert!(ErrorClassification::Permanent.is_credential_failure());
        assert!(!ErrorClassification::Transient.is_credential_failure());
    }
}
