//! # Flock Core
//!
//! Single-flight request coalescing for axum and tower services.
//!
//! When several identical requests arrive concurrently, only the first one
//! (the *leader*) reaches the wrapped handler. The others (*followers*) wait
//! for it and receive a byte-identical copy of its response.
//!
//! ```text
//!  request ──▶ policy ──no──▶ handler
//!                │
//!               yes
//!                ▼
//!          fingerprint ──▶ registry ──miss──▶ leader: handler ──▶ capture
//!                              │                                    │
//!                             hit                                 seal
//!                              ▼                                    ▼
//!                      follower: wait ◀──── done ◀──── fan-out to every sink
//! ```
//!
//! Coalescing is opt-in per request: a [`CoalescePolicy`] names a header
//! and value the client must send.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use axum::{routing::get, Router};
//! use flock_core::{CoalescePolicy, Group};
//!
//! let group = Arc::new(Group::with_defaults());
//! let app: Router = Router::new().route(
//!     "/report",
//!     get(|| async { "expensive" }).layer(group.layer(CoalescePolicy::header("x-fly", "abc"))),
//! );
//! ```
//!
//! ## Modules
//!
//! - [`fingerprint`] - Request identity derivation
//! - [`policy`] - Admission gate
//! - [`capture`] - Response capture and replay snapshots
//! - [`call`] - In-flight call records, sinks and completion signal
//! - [`group`] - The coalescing registry
//! - [`pool`] - Object pools for call records and body buffers
//! - [`layer`] - Tower middleware

pub mod call;
pub mod capture;
pub mod error;
pub mod fingerprint;
pub mod group;
pub mod layer;
pub mod policy;
pub mod pool;

pub use call::{fan_out, Call, Completion, CompletionWaiter, ReplySink, ResponseSink};
pub use capture::{CaptureBuffer, Replay};
pub use error::{CoalesceError, LeaderFailure, Result};
pub use fingerprint::{canonical_key, Fingerprint, FingerprintDeriver};
pub use group::{CoalescerConfig, CoalescerStats, Group};
pub use layer::{Coalesce, CoalesceLayer};
pub use policy::CoalescePolicy;
pub use pool::{Pool, PoolConfig, PoolStats, Reusable};
