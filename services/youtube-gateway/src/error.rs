//! Per-request errors and their HTTP mapping
//!
//! Every failed request renders as
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use key_pool::DispatchError;
use thiserror::Error;

/// Reasons a gateway request fails.
#[derive(Error, Debug)]
pub enum Error {
    #[error("missing required query parameter: {0}")]
    MissingParam(&'static str),

    #[error("invalid query parameter {name}: {reason}")]
    InvalidParam { name: &'static str, reason: String },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Result alias using the gateway Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::MissingParam(_) | Error::InvalidParam { .. } => StatusCode::BAD_REQUEST,
            Error::Dispatch(e) => match e {
                DispatchError::AllCredentialsExhausted => StatusCode::TOO_MANY_REQUESTS,
                DispatchError::Transport { .. } => StatusCode::GATEWAY_TIMEOUT,
                DispatchError::Upstream { .. } | DispatchError::Decode(_) => {
                    StatusCode::BAD_GATEWAY
                }
                DispatchError::RetriesExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
                DispatchError::InvalidRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Value of the `type` field in the error body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::MissingParam(_) | Error::InvalidParam { .. } => "invalid_request",
            Error::Dispatch(e) => e.kind(),
        }
    }

    /// Render with the request id attached.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let mut error = serde_json::json!({
            "type": self.error_type(),
            "message": self.to_string(),
            "request_id": request_id,
        });
        if let Error::Dispatch(DispatchError::Upstream { status, body }) = &self {
            error["upstream_status"] = (*status).into();
            error["upstream_body"] = upstream_body(body);
        }
        if let Error::Dispatch(DispatchError::RetriesExhausted {
            last_status,
            last_body,
            ..
        }) = &self
        {
            if let Some(status) = last_status {
                error["upstream_status"] = (*status).into();
            }
            if let Some(body) = last_body {
                error["upstream_body"] = upstream_body(body);
            }
        }
        error_response(self.status(), serde_json::json!({ "error": error }))
    }
}

/// Upstream body as JSON when it parses, as a string otherwise.
fn upstream_body(body: &str) -> serde_json::Value {
    serde_json::from_str(body).unwrap_or_else(|_| serde_json::Value::String(body.to_owned()))
}

fn error_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
