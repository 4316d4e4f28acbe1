//! Request ID propagation and HTTP metrics middleware.

use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use super::metrics::MetricsState;
use crate::api::AppState;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Path label for requests that matched no route.
const UNMATCHED_PATH: &str = "unmatched";

/// Reuses the caller's `x-request-id` or generates one, runs the request in
/// a span carrying it and echoes it on the response.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        uri = %request.uri(),
    );

    let mut response = next.run(request).instrument(span).await;

    // Replayed responses carry the leader's id. Each caller gets its own.
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER, header_value);
    }

    response
}

/// Records HTTP request metrics.
pub async fn metrics_middleware(
    State(metrics): State<Arc<MetricsState>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_PATH.to_string());

    metrics.http_active_requests.inc();
    let response = next.run(request).await;
    metrics.http_active_requests.dec();

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16();

    metrics.record_http_request(&method, &path, status, duration);

    tracing::debug!(
        method = %method,
        path = %path,
        status = %status,
        duration_ms = %format!("{:.2}", duration * 1000.0),
        "Request completed"
    );

    response
}

/// Serves the Prometheus scrape endpoint.
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    state.metrics.observe_group(&state.group);

    match state.metrics.encode() {
        Ok(body) => (
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            Body::from(body),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
