//! Failure classification for the HTTP collaborators (snapshot source and
//! inference endpoint).

use axum::http::StatusCode;
use serde_json::Value;

/// Longest upstream error body kept for logs and responses.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("{service} timed out")]
    Timeout { service: &'static str },

    #[error("{service} unreachable: {source}")]
    Connect {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("invalid response format from {service}: {reason}")]
    Body { service: &'static str, reason: String },

    #[error("{service} request failed: {source}")]
    Request {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

impl UpstreamError {
    // ---
    /// Classify a transport error by kind.
    pub fn from_reqwest(service: &'static str, err: reqwest::Error) -> Self {
        // ---
        if err.is_timeout() {
            UpstreamError::Timeout { service }
        } else if err.is_connect() {
            UpstreamError::Connect { service, source: err }
        } else if let Some(status) = err.status() {
            UpstreamError::Status {
                service,
                status: status.as_u16(),
                body: String::new(),
            }
        } else {
            UpstreamError::Request { service, source: err }
        }
    }

    /// Status code reported to our own caller.
    pub fn status_code(&self) -> StatusCode {
        // ---
        match self {
            UpstreamError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            UpstreamError::Connect { .. } => StatusCode::SERVICE_UNAVAILABLE,
            UpstreamError::Status { .. } => StatusCode::BAD_GATEWAY,
            UpstreamError::Body { .. } | UpstreamError::Request { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Read a response as JSON, turning non-2xx statuses into errors.
///
/// A JSON string body stays a `Value::String`; unwrapping double-encoded
/// payloads is left to the caller.
pub async fn read_json(
    service: &'static str,
    response: reqwest::Response,
) -> Result<Value, UpstreamError> {
    // ---
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| UpstreamError::from_reqwest(service, e))?;

    if !status.is_success() {
        return Err(UpstreamError::Status {
            service,
            status: status.as_u16(),
            body: truncate(body),
        });
    }

    serde_json::from_str(&body).map_err(|e| {
        tracing::error!(service, body = %truncate(body.clone()), "Invalid JSON response");
        UpstreamError::Body {
            service,
            reason: e.to_string(),
        }
    })
}

fn truncate(mut body: String) -> String {
    // ---
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    body
}
