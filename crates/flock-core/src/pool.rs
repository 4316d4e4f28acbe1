//! Object pooling for per-request scratch state.
//!
//! Coalescing allocates a call record and a body buffer for every admitted
//! request. Both are recycled through a [`Pool`] so steady-state traffic
//! does not hit the allocator for them.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Initial capacity of a freshly allocated body scratch buffer.
pub const SCRATCH_CAPACITY: usize = 4096;

/// Types that can be returned to a [`Pool`] and handed out again.
pub trait Reusable: Send {
    /// Clears all per-use state while keeping allocations.
    fn reset(&mut self);

    /// Returns true if no per-use state is left.
    fn is_reset(&self) -> bool;
}

impl Reusable for BytesMut {
    fn reset(&mut self) {
        self.clear();
    }

    fn is_reset(&self) -> bool {
        self.is_empty()
    }
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of idle instances kept for reuse.
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_idle: 1024 }
    }
}

/// Statistics for a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances currently idle in the pool.
    pub idle: usize,
    /// Instances allocated because the pool was empty.
    pub total_created: u64,
    /// Acquisitions served from the idle list.
    pub total_reused: u64,
    /// Released instances dropped because the pool was full.
    pub total_discarded: u64,
}

#[derive(Default)]
struct PoolStatsInner {
    total_created: AtomicU64,
    total_reused: AtomicU64,
    total_discarded: AtomicU64,
}

/// A bounded pool of reusable objects.
///
/// [`acquire`](Pool::acquire) never fails: an empty pool falls back to the
/// factory. [`release`](Pool::release) resets the instance before it is
/// stored.
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    config: PoolConfig,
    stats: PoolStatsInner,
}

impl<T: Reusable> Pool<T> {
    /// Creates a new pool.
    pub fn new<F>(factory: F, config: PoolConfig) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            idle: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            config,
            stats: PoolStatsInner::default(),
        }
    }

    /// Creates a pool with default configuration.
    pub fn with_defaults<F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::new(factory, PoolConfig::default())
    }

    /// Takes an instance from the pool, allocating one if none is idle.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if a pooled instance was stored without being
    /// reset. Release builds log the violation and reset the instance.
    pub fn acquire(&self) -> T {
        let pooled = self.idle.lock().pop();

        match pooled {
            Some(mut item) => {
                self.stats.total_reused.fetch_add(1, Ordering::Relaxed);
                if !item.is_reset() {
                    tracing::error!("pooled object handed out without being reset");
                    if cfg!(debug_assertions) {
                        panic!("pool corruption: pooled object was not reset before reuse");
                    }
                    item.reset();
                }
                item
            }
            None => {
                self.stats.total_created.fetch_add(1, Ordering::Relaxed);
                (self.factory)()
            }
        }
    }

    /// Resets an instance and returns it to the pool.
    pub fn release(&self, mut item: T) {
        item.reset();

        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle {
            idle.push(item);
        } else {
            drop(idle);
            self.stats.total_discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            total_created: self.stats.total_created.load(Ordering::Relaxed),
            total_reused: self.stats.total_reused.load(Ordering::Relaxed),
            total_discarded: self.stats.total_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Creates the pool used for request body scratch buffers.
pub fn scratch_pool(config: PoolConfig) -> Pool<BytesMut> {
    Pool::new(|| BytesMut::with_capacity(SCRATCH_CAPACITY), config)
}
