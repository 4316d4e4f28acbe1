//! The coalescing registry.
//!
//! A [`Group`] maps request fingerprints to in-flight calls. The first
//! request for a fingerprint becomes the leader and runs the wrapped
//! handler; concurrent duplicates register a sink on the leader's call and
//! wait. When the handler returns, the leader seals the call, replays the
//! captured response into every sink and releases the record to a pool.
//!
//! Sealing happens under the registry lock, the same lock followers take to
//! join, so no sink can be added to a call that is being flushed.

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::call::{fan_out, Call, CompletionWaiter, ReplySink, ResponseSink};
use crate::capture::{CaptureBuffer, Replay};
use crate::error::{panic_message, CoalesceError, LeaderFailure, Result};
use crate::fingerprint::{Fingerprint, FingerprintDeriver};
use crate::layer::CoalesceLayer;
use crate::policy::CoalescePolicy;
use crate::pool::{Pool, PoolConfig, PoolStats};

/// Configuration for request coalescing.
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Maximum time a follower waits for its leader.
    pub follower_timeout: Duration,
    /// Maximum number of in-flight calls to track. Requests beyond this
    /// are forwarded without coalescing.
    pub max_in_flight: usize,
    /// Largest request body buffered for fingerprinting.
    pub max_body_bytes: usize,
    /// Largest handler response buffered for replay.
    pub max_response_bytes: usize,
    /// Pool settings for call records.
    pub call_pool: PoolConfig,
    /// Pool settings for request body scratch buffers.
    pub buffer_pool: PoolConfig,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            follower_timeout: Duration::from_secs(30),
            max_in_flight: 10_000,
            max_body_bytes: 8 * 1024 * 1024,
            max_response_bytes: 8 * 1024 * 1024,
            call_pool: PoolConfig::default(),
            buffer_pool: PoolConfig::default(),
        }
    }
}

/// Statistics for request coalescing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoalescerStats {
    /// Total requests received.
    pub total_requests: u64,
    /// Requests that joined an in-flight call.
    pub coalesced_requests: u64,
    /// Requests that led a new call.
    pub new_fetches: u64,
    /// Requests forwarded without touching the registry.
    pub bypassed_requests: u64,
    /// Followers that gave up waiting.
    pub follower_timeouts: u64,
    /// Leader executions that ended in a synthetic error response.
    pub leader_failures: u64,
    /// Current number of in-flight calls.
    pub in_flight: usize,
}

impl CoalescerStats {
    /// Returns the coalescing ratio.
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / self.total_requests as f64
        }
    }
}

#[derive(Default)]
struct CoalescerStatsInner {
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    new_fetches: AtomicU64,
    bypassed_requests: AtomicU64,
    follower_timeouts: AtomicU64,
    leader_failures: AtomicU64,
}

/// Generational reference to a call slot.
///
/// A handle outlives its call: once the slot is reused the generation no
/// longer matches and lookups through the stale handle miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallHandle {
    index: usize,
    generation: u64,
}

struct Slot {
    generation: u64,
    call: Option<Call>,
}

/// Fingerprint index plus the arena of live calls.
#[derive(Default)]
struct Registry {
    index: HashMap<Fingerprint, CallHandle>,
    slots: Vec<Slot>,
    vacant: Vec<usize>,
}

impl Registry {
    fn insert(&mut self, call: Call) -> CallHandle {
        match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.generation += 1;
                slot.call = Some(call);
                CallHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    call: Some(call),
                });
                CallHandle {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        }
    }

    fn get_mut(&mut self, handle: CallHandle) -> Option<&mut Call> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.call.as_mut())
    }

    fn remove(&mut self, handle: CallHandle) -> Option<Call> {
        let slot = self
            .slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)?;
        let call = slot.call.take()?;
        self.vacant.push(handle.index);
        Some(call)
    }

    fn live(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }
}

/// What a request does after consulting the registry.
enum Role {
    /// Run the handler; the capture buffer is checked out of the call.
    Leader {
        handle: CallHandle,
        capture: CaptureBuffer,
    },
    /// Wait for the leader's response.
    Follower(CompletionWaiter),
    /// The registry is full; forward without coalescing.
    Bypass,
}

/// A coalescing domain.
///
/// Each group is independent: requests are only merged with in-flight
/// requests of the same group.
pub struct Group {
    registry: Mutex<Registry>,
    calls: Pool<Call>,
    deriver: FingerprintDeriver,
    config: CoalescerConfig,
    stats: CoalescerStatsInner,
}

impl Group {
    /// Creates a new group.
    pub fn new(config: CoalescerConfig) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            calls: Pool::new(Call::new, config.call_pool.clone()),
            deriver: FingerprintDeriver::new(config.max_body_bytes, config.buffer_pool.clone()),
            config,
            stats: CoalescerStatsInner::default(),
        }
    }

    /// Creates a group with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(CoalescerConfig::default())
    }

    /// Returns a tower layer coalescing requests admitted by `policy`.
    pub fn layer(self: &Arc<Self>, policy: CoalescePolicy) -> CoalesceLayer {
        CoalesceLayer::new(Arc::clone(self), policy)
    }

    /// Serves `request`, coalescing it with identical in-flight requests if
    /// `policy` admits it.
    ///
    /// `forward` runs the wrapped handler. It is invoked at most once per
    /// call: directly for requests the policy rejects, by the leader
    /// otherwise.
    pub async fn coalesce<F, Fut>(
        &self,
        policy: &CoalescePolicy,
        request: Request,
        forward: F,
    ) -> Result<Response>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        if !policy.admits(&request) {
            self.stats.bypassed_requests.fetch_add(1, Ordering::Relaxed);
            return Ok(forward(request).await);
        }

        let (fingerprint, request) = match self.deriver.derive(request).await {
            Ok(derived) => derived,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fingerprint request");
                return Err(e);
            }
        };

        self.run(fingerprint, request, forward).await
    }

    /// Serves `request` under an explicit fingerprint, skipping the policy.
    pub async fn coalesce_keyed<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        request: Request,
        forward: F,
    ) -> Result<Response>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        self.run(fingerprint, request, forward).await
    }

    async fn run<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        request: Request,
        forward: F,
    ) -> Result<Response>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let (sink, reply) = ReplySink::channel();

        match self.join(&fingerprint, Box::new(sink)) {
            Role::Bypass => {
                self.stats.bypassed_requests.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    fingerprint = ?fingerprint,
                    max_in_flight = self.config.max_in_flight,
                    "Registry full, forwarding without coalescing"
                );
                Ok(forward(request).await)
            }
            Role::Follower(waiter) => {
                self.stats.coalesced_requests.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fingerprint = ?fingerprint, "Joined in-flight request");

                let timeout = self.config.follower_timeout;
                if tokio::time::timeout(timeout, waiter.wait()).await.is_err() {
                    self.stats.follower_timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        fingerprint = ?fingerprint,
                        timeout_ms = timeout.as_millis() as u64,
                        "Gave up waiting for in-flight request"
                    );
                    return Err(CoalesceError::FollowerTimeout(timeout));
                }

                receive(reply)
            }
            Role::Leader { handle, capture } => {
                self.stats.new_fetches.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fingerprint = ?fingerprint, "Leading new request");

                let mut flight = Flight {
                    group: self,
                    fingerprint,
                    handle,
                    capture,
                    landed: false,
                };

                let handler = AssertUnwindSafe(async move { forward(request).await });
                let outcome = match handler.catch_unwind().await {
                    Ok(response) => {
                        flight
                            .capture
                            .record(response, self.config.max_response_bytes)
                            .await
                    }
                    Err(panic) => Err(LeaderFailure::Panicked(panic_message(panic.as_ref()))),
                };
                flight.land(outcome);

                receive(reply)
            }
        }
    }

    /// Registers `sink` under `fingerprint` and decides the caller's role.
    fn join(&self, fingerprint: &Fingerprint, sink: Box<dyn ResponseSink>) -> Role {
        let mut registry = self.registry.lock();

        // A sealed call is being flushed; its sink comes back and the caller
        // starts a fresh call instead.
        let sink = match registry.index.get(fingerprint).copied() {
            Some(handle) => match registry.get_mut(handle) {
                Some(call) => match call.add_sink(sink) {
                    Ok(waiter) => return Role::Follower(waiter),
                    Err(sink) => sink,
                },
                None => sink,
            },
            None => sink,
        };

        if registry.live() >= self.config.max_in_flight {
            return Role::Bypass;
        }

        let mut call = self.calls.acquire();
        let capture = std::mem::take(&mut call.capture);
        call.sinks.push(sink);

        let handle = registry.insert(call);
        registry.index.insert(*fingerprint, handle);

        Role::Leader { handle, capture }
    }

    /// Seals the call, replays the captured response and retires the call.
    ///
    /// Returns the number of sinks that received the response.
    fn finish(
        &self,
        fingerprint: &Fingerprint,
        handle: CallHandle,
        capture: CaptureBuffer,
    ) -> usize {
        let (replay, mut sinks) = {
            let mut registry = self.registry.lock();
            let Some(call) = registry.get_mut(handle) else {
                tracing::error!(
                    fingerprint = ?fingerprint,
                    "In-flight call vanished before completion"
                );
                return 0;
            };
            call.capture = capture;
            let sinks = call.seal();
            (call.capture.finish(), sinks)
        };

        let delivered = fan_out(&replay, &mut sinks);

        let call = {
            let mut registry = self.registry.lock();
            // A newer call may have taken over the fingerprint after sealing.
            if registry.index.get(fingerprint) == Some(&handle) {
                registry.index.remove(fingerprint);
            }
            registry.remove(handle)
        };

        if let Some(mut call) = call {
            call.done.signal();
            sinks.clear();
            call.sinks = sinks;
            self.calls.release(call);
        }

        delivered
    }

    /// Returns statistics.
    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            total_requests: self.stats.total_requests.load(Ordering::Relaxed),
            coalesced_requests: self.stats.coalesced_requests.load(Ordering::Relaxed),
            new_fetches: self.stats.new_fetches.load(Ordering::Relaxed),
            bypassed_requests: self.stats.bypassed_requests.load(Ordering::Relaxed),
            follower_timeouts: self.stats.follower_timeouts.load(Ordering::Relaxed),
            leader_failures: self.stats.leader_failures.load(Ordering::Relaxed),
            in_flight: self.registry.lock().live(),
        }
    }

    /// Returns statistics of the call record pool.
    pub fn call_pool_stats(&self) -> PoolStats {
        self.calls.stats()
    }

    /// Returns statistics of the request body scratch pool.
    pub fn buffer_pool_stats(&self) -> PoolStats {
        self.deriver.scratch_stats()
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// The leader's claim on a call.
///
/// Dropping a flight that has not landed (the leader's request future was
/// cancelled) still completes the call with an error response, so
/// followers are never stranded.
struct Flight<'g> {
    group: &'g Group,
    fingerprint: Fingerprint,
    handle: CallHandle,
    capture: CaptureBuffer,
    landed: bool,
}

impl Flight<'_> {
    fn land(&mut self, outcome: std::result::Result<(), LeaderFailure>) {
        if self.landed {
            return;
        }
        self.landed = true;

        if let Err(failure) = outcome {
            self.group
                .stats
                .leader_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                fingerprint = ?self.fingerprint,
                error = %failure,
                "Leader execution failed, replaying error response"
            );
            failure.write_into(&mut self.capture);
        }

        let capture = std::mem::take(&mut self.capture);
        let delivered = self.group.finish(&self.fingerprint, self.handle, capture);
        tracing::debug!(fingerprint = ?self.fingerprint, delivered, "Replayed response");
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if !self.landed {
            self.land(Err(LeaderFailure::Cancelled));
        }
    }
}

fn receive(mut reply: oneshot::Receiver<Replay>) -> Result<Response> {
    reply
        .try_recv()
        .map(IntoResponse::into_response)
        .map_err(|_| CoalesceError::MissingReplay)
}
