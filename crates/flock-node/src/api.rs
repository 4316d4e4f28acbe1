//! HTTP API for the demo node.
//!
//! | Route       | Behavior                                              |
//! |-------------|-------------------------------------------------------|
//! | `/single`   | greet handler behind the coalescing layer             |
//! | `/original` | the same handler without coalescing                   |
//! | `/count`    | number of times the greet handler has run             |
//! | `/health`   | liveness and coalescer counters                       |
//! | `/metrics`  | Prometheus scrape endpoint                            |
//!
//! Unknown paths get a JSON 404 and unsupported methods a JSON 405.

use axum::{
    extract::State,
    http::{HeaderName, HeaderValue, Method, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use flock_core::{CoalescePolicy, Group};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tower_http::{
    catch_panic::CatchPanicLayer,
    timeout::{RequestBodyTimeoutLayer, TimeoutLayer},
    trace::TraceLayer,
};

use crate::config::{Config, ServerConfig};
use crate::observability::{metrics_handler, metrics_middleware, request_id_middleware, MetricsState};

/// Header carrying the time the greeting was produced, in Unix milliseconds.
pub const GREETED_AT_HEADER: HeaderName = HeaderName::from_static("x-greeted-at");

/// Body returned by the greet handler.
pub const GREETING: &str = "Hello World!";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Times the greet handler has run.
    pub greetings: Arc<AtomicU64>,
    /// Simulated work per greeting.
    pub greet_delay: Duration,
    /// Coalescing group guarding `/single`.
    pub group: Arc<Group>,
    /// Node metrics.
    pub metrics: Arc<MetricsState>,
}

impl AppState {
    /// Builds state from configuration.
    pub fn new(config: &Config) -> Self {
        Self {
            greetings: Arc::new(AtomicU64::new(0)),
            greet_delay: Duration::from_millis(config.demo.greet_delay_ms),
            group: Arc::new(Group::new(config.coalesce.coalescer_config())),
            metrics: Arc::new(MetricsState::new()),
        }
    }

    /// Times the greet handler has run.
    pub fn greetings(&self) -> u64 {
        self.greetings.load(Ordering::SeqCst)
    }
}

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `ok` while the node serves requests.
    pub status: &'static str,
    /// Requests seen by the coalescer.
    pub coalesced_total: u64,
    /// Requests answered from another request's execution.
    pub coalesced_followers: u64,
    /// Distinct requests currently in flight.
    pub in_flight: usize,
}

/// Error body for unknown routes and methods.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

/// Creates the node's router.
pub fn create_router(state: AppState, policy: CoalescePolicy, server: &ServerConfig) -> Router {
    let single = get(greet).layer(state.group.layer(policy));

    Router::new()
        .route("/single", single)
        .route("/original", get(greet))
        .route("/count", get(count))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.metrics),
            metrics_middleware,
        ))
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(server.write_timeout()))
        .layer(RequestBodyTimeoutLayer::new(server.read_timeout()))
        .layer(CatchPanicLayer::new())
}

/// Counts the call, simulates work and greets.
async fn greet(State(state): State<AppState>) -> impl IntoResponse {
    state.greetings.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(state.greet_delay).await;

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();

    let mut response = GREETING.into_response();
    if let Ok(value) = HeaderValue::from_str(&millis.to_string()) {
        response.headers_mut().insert(GREETED_AT_HEADER, value);
    }
    response
}

async fn count(State(state): State<AppState>) -> String {
    format!("{}\n", state.greetings())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.group.stats();
    Json(HealthResponse {
        status: "ok",
        coalesced_total: stats.total_requests,
        coalesced_followers: stats.coalesced_requests,
        in_flight: stats.in_flight,
    })
}

async fn not_found(uri: Uri) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("no route for {}", uri.path()),
    )
}

async fn method_not_allowed(method: Method, uri: Uri) -> Response {
    error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
        format!("{method} is not allowed on {}", uri.path()),
    )
}

fn error_response(status: StatusCode, error: &'static str, message: String) -> Response {
    (status, Json(ErrorResponse { error, message })).into_response()
}
