//! Prometheus metrics collection.
//!
//! Each node owns its own [`MetricsState`]. HTTP metrics are recorded by
//! middleware as requests complete. Coalescing and pool counters are
//! advanced to the group's running totals when the registry is scraped.

use flock_core::{Group, PoolStats};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use parking_lot::Mutex;
use std::sync::Arc;

/// HTTP request labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Matched route pattern
    pub path: String,
    /// Response status code
    pub status: u16,
}

/// Coalescing outcome labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CoalesceLabels {
    /// One of total, leader, follower, bypassed, follower_timeout, leader_failure
    pub outcome: String,
}

/// Object pool labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PoolLabels {
    /// Pool name (calls, buffers)
    pub pool: String,
}

/// Object pool event labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PoolEventLabels {
    /// Pool name (calls, buffers)
    pub pool: String,
    /// Event (created, reused, discarded)
    pub event: String,
}

/// Metrics state container.
#[derive(Clone)]
pub struct MetricsState {
    registry: Arc<Registry>,
    /// HTTP request counter.
    pub http_requests_total: Family<HttpLabels, Counter>,
    /// HTTP request duration histogram (seconds).
    pub http_request_duration_seconds: Family<HttpLabels, Histogram>,
    /// Requests currently being served.
    pub http_active_requests: Gauge,
    /// Requests seen by the coalescer, by outcome.
    pub coalesce_requests_total: Family<CoalesceLabels, Counter>,
    /// Distinct requests currently in flight.
    pub coalesce_in_flight: Gauge,
    /// Idle objects per pool.
    pub pool_idle: Family<PoolLabels, Gauge>,
    /// Pool events.
    pub pool_events_total: Family<PoolEventLabels, Counter>,
    /// Serializes scrapes so counters are never advanced twice.
    sync: Arc<Mutex<()>>,
}

impl Default for MetricsState {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsState {
    /// Create a new metrics state with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_requests_total = Family::<HttpLabels, Counter>::default();
        registry.register(
            "flock_http_requests",
            "Total HTTP requests",
            http_requests_total.clone(),
        );

        let http_request_duration_seconds =
            Family::<HttpLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 16))
            });
        registry.register(
            "flock_http_request_duration_seconds",
            "HTTP request duration in seconds",
            http_request_duration_seconds.clone(),
        );

        let http_active_requests = Gauge::default();
        registry.register(
            "flock_http_active_requests",
            "Number of HTTP requests being served",
            http_active_requests.clone(),
        );

        let coalesce_requests_total = Family::<CoalesceLabels, Counter>::default();
        registry.register(
            "flock_coalesce_requests",
            "Requests handled by the coalescer by outcome",
            coalesce_requests_total.clone(),
        );

        let coalesce_in_flight = Gauge::default();
        registry.register(
            "flock_coalesce_in_flight",
            "Distinct requests currently in flight",
            coalesce_in_flight.clone(),
        );

        let pool_idle = Family::<PoolLabels, Gauge>::default();
        registry.register(
            "flock_pool_idle",
            "Idle objects kept for reuse",
            pool_idle.clone(),
        );

        let pool_events_total = Family::<PoolEventLabels, Counter>::default();
        registry.register(
            "flock_pool_events",
            "Object pool allocations, reuses and discards",
            pool_events_total.clone(),
        );

        Self {
            registry: Arc::new(registry),
            http_requests_total,
            http_request_duration_seconds,
            http_active_requests,
            coalesce_requests_total,
            coalesce_in_flight,
            pool_idle,
            pool_events_total,
            sync: Arc::new(Mutex::new(())),
        }
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let labels = HttpLabels {
            method: method.to_string(),
            path: path.to_string(),
            status,
        };

        self.http_requests_total.get_or_create(&labels).inc();
        self.http_request_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Bring the coalescing and pool metrics up to date with `group`.
    pub fn observe_group(&self, group: &Group) {
        let _sync = self.sync.lock();
        let stats = group.stats();
        for (outcome, total) in [
            ("total", stats.total_requests),
            ("leader", stats.new_fetches),
            ("follower", stats.coalesced_requests),
            ("bypassed", stats.bypassed_requests),
            ("follower_timeout", stats.follower_timeouts),
            ("leader_failure", stats.leader_failures),
        ] {
            let counter = self.coalesce_requests_total.get_or_create(&CoalesceLabels {
                outcome: outcome.to_string(),
            });
            advance(&counter, total);
        }
        self.coalesce_in_flight.set(stats.in_flight as i64);

        self.observe_pool("calls", group.call_pool_stats());
        self.observe_pool("buffers", group.buffer_pool_stats());
    }

    fn observe_pool(&self, pool: &str, stats: PoolStats) {
        self.pool_idle
            .get_or_create(&PoolLabels {
                pool: pool.to_string(),
            })
            .set(stats.idle as i64);

        for (event, total) in [
            ("created", stats.total_created),
            ("reused", stats.total_reused),
            ("discarded", stats.total_discarded),
        ] {
            let counter = self.pool_events_total.get_or_create(&PoolEventLabels {
                pool: pool.to_string(),
                event: event.to_string(),
            });
            advance(&counter, total);
        }
    }

    /// Encode metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

/// Moves `counter` forward to `total`. Totals never decrease.
fn advance(counter: &Counter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}
