//! In-flight call records and response fan-out.

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use tokio::sync::{oneshot, watch};

use crate::capture::{CaptureBuffer, Replay};
use crate::pool::Reusable;

/// Destination for a replayed response.
pub trait ResponseSink: Send {
    /// Writes the full response. Returns false if the receiver is gone.
    fn write(&mut self, status: StatusCode, headers: &HeaderMap, body: &Bytes) -> bool;
}

/// A sink delivering the replay to a waiting request task.
pub struct ReplySink {
    tx: Option<oneshot::Sender<Replay>>,
}

impl ReplySink {
    /// Creates a sink and the receiver its replay will arrive on.
    pub fn channel() -> (Self, oneshot::Receiver<Replay>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }
}

impl ResponseSink for ReplySink {
    fn write(&mut self, status: StatusCode, headers: &HeaderMap, body: &Bytes) -> bool {
        match self.tx.take() {
            Some(tx) => tx
                .send(Replay {
                    status,
                    headers: headers.clone(),
                    body: body.clone(),
                })
                .is_ok(),
            None => false,
        }
    }
}

/// Writes `replay` to every sink in registration order.
///
/// Returns the number of sinks that accepted the response.
pub fn fan_out(replay: &Replay, sinks: &mut [Box<dyn ResponseSink>]) -> usize {
    sinks
        .iter_mut()
        .map(|sink| sink.write(replay.status, &replay.headers, &replay.body))
        .filter(|delivered| *delivered)
        .count()
}

/// One-shot broadcast completion signal that survives record reuse.
///
/// The signal is an epoch counter. A waiter remembers the epoch it must see,
/// so a signal is never lost to a waiter that subscribes before it fires,
/// and resetting the owning call never un-signals anyone.
pub struct Completion {
    epoch: watch::Sender<u64>,
}

impl Completion {
    /// Creates an unsignalled completion.
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self { epoch }
    }

    /// Subscribes to the next signal.
    pub fn waiter(&self) -> CompletionWaiter {
        let rx = self.epoch.subscribe();
        let target = *rx.borrow() + 1;
        CompletionWaiter { rx, target }
    }

    /// Fires the signal, waking every current waiter.
    pub fn signal(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle held by a follower until its call completes.
pub struct CompletionWaiter {
    rx: watch::Receiver<u64>,
    target: u64,
}

impl CompletionWaiter {
    /// Waits for the signal.
    pub async fn wait(mut self) {
        let target = self.target;
        // A closed channel means the record was dropped, which only happens
        // after it has been signalled.
        let _ = self.rx.wait_for(|epoch| *epoch >= target).await;
    }
}

/// One coalescing unit: the leader's capture, the sinks waiting on it and
/// the completion signal.
///
/// Call records are pooled. While a leader runs, its capture buffer is
/// checked out of the record so the handler can write to it without holding
/// the registry lock.
pub struct Call {
    pub(crate) capture: CaptureBuffer,
    pub(crate) sinks: Vec<Box<dyn ResponseSink>>,
    pub(crate) done: Completion,
    pub(crate) sealed: bool,
}

impl Call {
    /// Creates an empty call record.
    pub fn new() -> Self {
        Self {
            capture: CaptureBuffer::new(),
            sinks: Vec::with_capacity(10),
            done: Completion::new(),
            sealed: false,
        }
    }

    /// Registers a sink. Returns it back if the call is already sealed.
    pub fn add_sink(
        &mut self,
        sink: Box<dyn ResponseSink>,
    ) -> Result<CompletionWaiter, Box<dyn ResponseSink>> {
        if self.sealed {
            return Err(sink);
        }
        self.sinks.push(sink);
        Ok(self.done.waiter())
    }

    /// Closes the call to new sinks and hands out the ones registered.
    pub fn seal(&mut self) -> Vec<Box<dyn ResponseSink>> {
        self.sealed = true;
        std::mem::take(&mut self.sinks)
    }
}

impl Default for Call {
    fn default() -> Self {
        Self::new()
    }
}

impl Reusable for Call {
    fn reset(&mut self) {
        self.capture.reset();
        self.sinks.clear();
        self.sealed = false;
    }

    fn is_reset(&self) -> bool {
        self.capture.is_reset() && self.sinks.is_empty() && !self.sealed
    }
}
