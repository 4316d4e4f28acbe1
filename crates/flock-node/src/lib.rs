//! # Flock Node
//!
//! HTTP server hosting a request coalescer in front of a demo handler.
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!  client ──▶│ catch-panic · body timeout · timeout     │
//!            │ trace · request id · metrics             │
//!            ├──────────────────────────────────────────┤
//!            │ /single   ──▶ CoalesceLayer ──▶ greet    │
//!            │ /original ──────────────────▶ greet      │
//!            │ /count  /health  /metrics                │
//!            └──────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cargo run --bin flock-node -- --listen-addr 127.0.0.1:9091
//! curl -H 'x-fly: abc' http://127.0.0.1:9091/single
//! ```
//!
//! ## Modules
//!
//! - [`api`] - Router, demo handlers and shared state
//! - [`config`] - Layered configuration
//! - [`observability`] - Logging, metrics and request IDs
//! - [`server`] - Listener lifecycle and graceful shutdown

pub mod api;
pub mod config;
pub mod observability;
pub mod server;

pub use api::{create_router, AppState};
pub use config::{Config, ConfigError};
