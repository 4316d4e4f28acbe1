//! Error types for request coalescing.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::capture::CaptureBuffer;

/// Errors returned to a single caller of the coalescing path.
///
/// None of these cross the follower boundary: a follower only ever sees the
/// response the leader replayed, or its own timeout.
#[derive(Debug, Error)]
pub enum CoalesceError {
    /// The request body could not be read while deriving the fingerprint.
    #[error("failed to read request body: {0}")]
    Fingerprint(#[source] axum::Error),

    /// The request body is larger than the configured buffering limit.
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge {
        /// Configured limit in bytes.
        limit: usize,
    },

    /// A follower gave up waiting on the leader.
    #[error("timed out after {0:?} waiting for in-flight request")]
    FollowerTimeout(Duration),

    /// The call completed without delivering a response to this caller.
    #[error("in-flight request completed without a response")]
    MissingReplay,
}

/// A specialized Result type for coalescing operations.
pub type Result<T> = std::result::Result<T, CoalesceError>;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl CoalesceError {
    /// HTTP status reported to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Fingerprint(_) => StatusCode::BAD_REQUEST,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::FollowerTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::MissingReplay => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Fingerprint(_) => "unreadable_body",
            Self::BodyTooLarge { .. } => "body_too_large",
            Self::FollowerTimeout(_) => "coalesce_timeout",
            Self::MissingReplay => "missing_replay",
        }
    }
}

impl IntoResponse for CoalesceError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.kind().to_string(),
            message: self.to_string(),
        });

        (self.status(), body).into_response()
    }
}

/// Ways a leader execution can fail to produce a normal response.
///
/// A failure is written into the call's capture buffer as a synthetic
/// response and fanned out like any other result.
#[derive(Debug, Error)]
pub enum LeaderFailure {
    /// The wrapped handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler's response body failed while being buffered.
    #[error("failed to buffer handler response: {0}")]
    Body(#[source] axum::Error),

    /// The handler's response body is larger than the capture limit.
    #[error("handler response exceeds {limit} bytes")]
    ResponseTooLarge {
        /// Configured limit in bytes.
        limit: usize,
    },

    /// The leader's future was dropped before the handler completed.
    #[error("leader request was cancelled before the handler completed")]
    Cancelled,
}

impl LeaderFailure {
    /// HTTP status of the synthetic response.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Panicked(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Body(_) | Self::ResponseTooLarge { .. } => StatusCode::BAD_GATEWAY,
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Panicked(_) => "handler_panicked",
            Self::Body(_) => "response_body_error",
            Self::ResponseTooLarge { .. } => "response_too_large",
            Self::Cancelled => "leader_cancelled",
        }
    }

    /// Replaces whatever was captured with the synthetic error response.
    pub fn write_into(&self, capture: &mut CaptureBuffer) {
        let payload = ErrorResponse {
            error: self.kind().to_string(),
            message: self.to_string(),
        };
        // Serializing two strings cannot fail.
        let body = serde_json::to_vec(&payload).unwrap_or_default();

        capture.clear();
        capture.set_status(self.status());
        capture.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        capture.append_body(&body);
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
