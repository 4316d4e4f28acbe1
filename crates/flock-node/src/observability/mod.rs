//! # Observability
//!
//! - **Structured logging**: pretty or JSON output filtered by `RUST_LOG`
//! - **Prometheus metrics**: HTTP traffic plus coalescing and pool gauges
//! - **Request IDs**: propagated from `x-request-id` or generated per request
//!
//! ## Usage
//!
//! ```rust,ignore
//! use axum::{middleware, Router};
//! use flock_node::observability::{init_logging, request_id_middleware, LogFormat};
//!
//! init_logging("info", LogFormat::Json);
//!
//! let app: Router<()> = Router::new().layer(middleware::from_fn(request_id_middleware));
//! ```

mod logging;
mod metrics;
pub mod middleware;

pub use logging::{init_logging, LogFormat};
pub use metrics::{CoalesceLabels, HttpLabels, MetricsState, PoolEventLabels, PoolLabels};
pub use middleware::{
    metrics_handler, metrics_middleware, request_id_middleware, REQUEST_ID_HEADER,
};
