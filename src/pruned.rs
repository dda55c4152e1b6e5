//! Bounded pool that expires idle resources, leases and old resources

use crate::basic::pool_name;
use crate::bounded::BoundedPool;
use crate::cancel::CancelToken;
use crate::config::{LeaseTraceLevel, PoolConfiguration};
use crate::errors::{PoolError, PoolResult};
use crate::events::{PoolEventKind, PoolEvents};
use crate::factory::ResourceFactory;
use crate::health::HealthStatus;
use crate::lease::{LeaseRecord, Pooled, ResourceId};
use crate::metrics::PoolMetrics;
use crate::scheduler::{PruneScheduler, PruneTarget, TaskId};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

#[derive(Default)]
struct PruneCounters {
    idle_expired: AtomicU64,
    lease_expired: AtomicU64,
    life_ended: AtomicU64,
    invalid: AtomicU64,
}

struct Shared<T> {
    pool: BoundedPool<T>,
    max_idle_time: Option<Duration>,
    max_lease_time: Option<Duration>,
    max_life_time: Option<Duration>,
    prune_interval: Option<Duration>,
    interrupt_leaser: bool,
    destroy_on_expired_lease: bool,
    lease_trace: LeaseTraceLevel,
    counters: PruneCounters,
    scheduler: PruneScheduler,
    task: Mutex<Option<TaskId>>,
}

/// A bounded pool that removes resources that were idle, leased or alive for too long.
///
/// Pruning runs on a [`PruneScheduler`] once the pool is opened. Whenever a
/// prune pass removes resources, the pool tops itself up to `min_size`, so a
/// pool recovers on its own after its resources went bad.
///
/// `PrunedPool` is a cheap handle: clones share the same pool.
///
/// # Examples
///
/// ```
/// use prunepool::{FnFactory, PoolConfiguration, PruneScheduler, PrunedPool};
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_name("sessions")
///     .with_min_size(1)
///     .with_max_size(3)
///     .with_max_lease_time(Duration::from_secs(5));
/// let scheduler = PruneScheduler::new("doc-pruner");
/// let pool = PrunedPool::with_scheduler(config, FnFactory::new(|| Ok(0u64)), scheduler.clone()).unwrap();
/// pool.open().unwrap();
/// assert!(scheduler.is_running());
///
/// let mut session = pool.acquire_timeout(Duration::from_millis(100)).unwrap();
/// *session += 1;
/// pool.release(session);
///
/// pool.close();
/// assert!(!scheduler.is_running());
/// ```
pub struct PrunedPool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PrunedPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> PrunedPool<T> {
    /// Create a pool pruned by the shared scheduler
    pub fn new<F>(config: PoolConfiguration, factory: F) -> PoolResult<Self>
    where
        F: ResourceFactory<T> + 'static,
    {
        Self::with_scheduler(config, factory, PruneScheduler::shared())
    }

    /// Create a pool pruned by the given scheduler
    pub fn with_scheduler<F>(
        config: PoolConfiguration,
        factory: F,
        scheduler: PruneScheduler,
    ) -> PoolResult<Self>
    where
        F: ResourceFactory<T> + 'static,
    {
        let name = pool_name(&config);
        let config = config.normalized(&name)?;
        let pool = BoundedPool::with_name(name, &config, Arc::new(factory));
        Ok(Self {
            shared: Arc::new(Shared {
                pool,
                max_idle_time: config.max_idle_time,
                max_lease_time: config.max_lease_time,
                max_life_time: config.max_life_time,
                prune_interval: config.prune_interval,
                interrupt_leaser: config.interrupt_leaser,
                destroy_on_expired_lease: config.destroy_on_expired_lease,
                lease_trace: config.lease_trace,
                counters: PruneCounters::default(),
                scheduler,
                task: Mutex::new(None),
            }),
        })
    }

    /// Open the pool with `min_size` resources and start pruning
    pub fn open(&self) -> PoolResult<()> {
        self.open_with(self.shared.pool.min_size())
    }

    /// Open the pool with `amount` resources (bounded by min and max size) and start pruning
    pub fn open_with(&self, amount: usize) -> PoolResult<()> {
        let mut task = self.shared.task.lock();
        if self.shared.pool.is_open() {
            return Ok(());
        }
        // An interval the scheduler refuses leaves the pool unopened.
        if let Some(interval) = self.shared.prune_interval.filter(|_| task.is_none()) {
            let target: Weak<Shared<T>> = Arc::downgrade(&self.shared);
            let target: Weak<dyn PruneTarget> = target;
            *task = Some(self.shared.scheduler.register(target, interval)?);
        }
        if let Err(e) = self.shared.pool.open_with(amount) {
            if let Some(id) = task.take() {
                self.shared.scheduler.deregister(id);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Acquire a resource using the configured acquire timeout
    pub fn acquire(&self) -> PoolResult<Pooled<T>> {
        self.acquire_timeout(self.shared.pool.acquire_timeout_default())
    }

    /// Acquire a valid resource within `timeout`, leased for the configured max. lease time
    pub fn acquire_timeout(&self, timeout: Duration) -> PoolResult<Pooled<T>> {
        self.acquire_with(timeout, self.shared.max_lease_time, None)
    }

    /// Acquire a resource with its own lease time instead of the configured one
    pub fn acquire_leased(&self, timeout: Duration, lease_time: Option<Duration>) -> PoolResult<Pooled<T>> {
        self.acquire_with(timeout, lease_time, None)
    }

    /// Acquire a resource, giving up with [`PoolError::Interrupted`] once `cancel` is cancelled.
    ///
    /// The token stays attached to the lease: when the lease expires and the
    /// pool interrupts leasers, the same token is cancelled.
    pub fn acquire_interruptible(
        &self,
        timeout: Duration,
        lease_time: Option<Duration>,
        cancel: &CancelToken,
    ) -> PoolResult<Pooled<T>> {
        self.acquire_with(timeout, lease_time, Some(cancel))
    }

    /// Acquire a resource without blocking the async runtime.
    ///
    /// The wait runs on tokio's blocking pool. Dropping the future cancels the wait.
    pub async fn acquire_async(&self, timeout: Duration) -> PoolResult<Pooled<T>> {
        let token = CancelToken::new();
        let mut guard = CancelOnDrop(Some(token.clone()));
        let pool = self.clone();
        let lease_time = self.shared.max_lease_time;
        let joined = tokio::task::spawn_blocking(move || {
            pool.acquire_with(timeout, lease_time, Some(&token))
        })
        .await;
        guard.0 = None;
        joined.unwrap_or_else(|_| {
            Err(PoolError::Interrupted {
                pool: self.name().to_string(),
            })
        })
    }

    fn acquire_with(
        &self,
        timeout: Duration,
        lease_time: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> PoolResult<Pooled<T>> {
        let pool = &self.shared.pool;
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let remaining = deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
            let lease = pool.acquire_with(remaining, cancel)?;
            if pool.validate(&lease) {
                pool.set_lease_end(lease.id(), lease_time.and_then(|t| Instant::now().checked_add(t)));
                return Ok(lease);
            }
            self.shared.counters.invalid.fetch_add(1, Ordering::Relaxed);
            pool.fire(PoolEventKind::Invalid, Some(lease.id()));
            debug!(pool = %pool.name(), resource = %lease.id(), "Removed invalid resource from pool");
            pool.discard(lease);
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(PoolError::AcquireTimeout {
                    pool: pool.name().to_string(),
                    timeout,
                });
            }
        }
    }

    /// Put a leased resource back in the pool, see [`BoundedPool::release`]
    pub fn release(&self, lease: Pooled<T>) -> bool {
        self.shared.pool.release(lease)
    }

    pub fn evict_idle(&self, id: ResourceId) -> bool {
        self.shared.pool.evict_idle(id)
    }

    /// Stop tracking a leased resource, see [`BoundedPool::evict_leased`]
    pub fn evict_leased(&self, id: ResourceId, destroy: bool) -> bool {
        self.shared.pool.evict_leased(id, destroy)
    }

    /// Remove every resource from the pool
    pub fn flush(&self) -> usize {
        self.shared.pool.flush()
    }

    /// Run a prune pass now. Returns the number of resources removed.
    pub fn prune(&self) -> usize {
        self.shared.prune_pass()
    }

    /// Create resources until the pool holds `min_size`.
    /// Returns the number of resources created.
    pub fn ensure_min_size(&self) -> usize {
        self.shared.ensure_min_size()
    }

    /// Stop pruning and close the pool
    pub fn close(&self) {
        if let Some(id) = self.shared.task.lock().take() {
            self.shared.scheduler.deregister(id);
        }
        self.shared.pool.close();
    }
}

impl<T> PrunedPool<T> {
    pub fn name(&self) -> &str {
        self.shared.pool.name()
    }

    pub fn events(&self) -> &PoolEvents {
        self.shared.pool.events()
    }

    pub fn size(&self) -> usize {
        self.shared.pool.size()
    }

    pub fn min_size(&self) -> usize {
        self.shared.pool.min_size()
    }

    pub fn max_size(&self) -> usize {
        self.shared.pool.max_size()
    }

    pub fn is_full(&self) -> bool {
        self.shared.pool.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.pool.is_empty()
    }

    pub fn idle_size(&self) -> usize {
        self.shared.pool.idle_size()
    }

    pub fn leased_size(&self) -> usize {
        self.shared.pool.leased_size()
    }

    pub fn waiting_size(&self) -> usize {
        self.shared.pool.waiting_size()
    }

    pub fn is_open(&self) -> bool {
        self.shared.pool.is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.pool.is_closed()
    }

    pub fn is_leased(&self, id: ResourceId) -> bool {
        self.shared.pool.is_leased(id)
    }

    pub fn scheduler(&self) -> &PruneScheduler {
        &self.shared.scheduler
    }

    pub fn created_count(&self) -> u64 {
        self.shared.pool.created_count()
    }

    pub fn destroyed_count(&self) -> u64 {
        self.shared.pool.destroyed_count()
    }

    /// Resources removed because they were idle too long
    pub fn idle_expired_count(&self) -> u64 {
        self.shared.counters.idle_expired.load(Ordering::Relaxed)
    }

    pub fn lease_expired_count(&self) -> u64 {
        self.shared.counters.lease_expired.load(Ordering::Relaxed)
    }

    pub fn life_ended_count(&self) -> u64 {
        self.shared.counters.life_ended.load(Ordering::Relaxed)
    }

    pub fn invalid_count(&self) -> u64 {
        self.shared.counters.invalid.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            idle_expired: self.idle_expired_count(),
            lease_expired: self.lease_expired_count(),
            life_ended: self.life_ended_count(),
            invalid: self.invalid_count(),
            ..self.shared.pool.metrics()
        }
    }

    pub fn health_status(&self) -> HealthStatus {
        HealthStatus::from_metrics(&self.metrics())
    }
}

impl<T: Send + 'static> Shared<T> {
    fn prune_pass(&self) -> usize {
        if !self.pool.is_open() {
            return 0;
        }
        let now = Instant::now();
        let evicted = self.expire_idle(now) + self.expire_leases(now) + self.expire_lives(now);
        if evicted > 0 {
            self.ensure_min_size();
        }
        trace!(
            pool = %self.pool.name(),
            evicted,
            size = self.pool.size(),
            idle = self.pool.idle_size(),
            leased = self.pool.leased_size(),
            "Pruned pool"
        );
        evicted
    }

    /// Idle resources above min size, longest idle first
    fn expire_idle(&self, now: Instant) -> usize {
        let Some(max_idle) = self.max_idle_time else {
            return 0;
        };
        let mut evicted = 0;
        while self.pool.remove_oldest_idle_if(|entry| {
            self.pool.size() > self.pool.min_size()
                && now.saturating_duration_since(entry.idle_since) > max_idle
        }) {
            self.counters.idle_expired.fetch_add(1, Ordering::Relaxed);
            evicted += 1;
        }
        evicted
    }

    fn expire_leases(&self, now: Instant) -> usize {
        let cancel = self.interrupt_leaser || self.destroy_on_expired_lease;
        let mut evicted = 0;
        for id in self.pool.expired_leases(now) {
            if let Some(record) = self.pool.remove_leased(id, cancel, true) {
                self.counters.lease_expired.fetch_add(1, Ordering::Relaxed);
                self.trace_expired_lease(id, &record);
                evicted += 1;
            }
        }
        evicted
    }

    fn trace_expired_lease(&self, id: ResourceId, record: &LeaseRecord) {
        let pool = self.pool.name();
        let leaser = record.leaser.as_str();
        let held = record.acquired_at.elapsed();
        match self.lease_trace {
            LeaseTraceLevel::Debug => {
                debug!(pool, resource = %id, leaser, ?held, "Lease expired")
            }
            LeaseTraceLevel::Info => {
                info!(pool, resource = %id, leaser, ?held, "Lease expired")
            }
            LeaseTraceLevel::Warn => {
                warn!(pool, resource = %id, leaser, ?held, "Lease expired")
            }
            LeaseTraceLevel::Error => {
                error!(pool, resource = %id, leaser, ?held, "Lease expired")
            }
        }
    }

    fn expire_lives(&self, now: Instant) -> usize {
        let Some(cutoff) = self.max_life_time.and_then(|life| now.checked_sub(life)) else {
            return 0;
        };
        let mut ended = 0;
        for id in self.pool.idle_created_before(cutoff) {
            if self.pool.remove_idle(id, false) {
                ended += 1;
            }
        }
        for id in self.pool.leased_created_before(cutoff) {
            if self
                .pool
                .remove_leased(id, self.destroy_on_expired_lease, false)
                .is_some()
            {
                ended += 1;
            }
        }
        self.counters
            .life_ended
            .fetch_add(ended as u64, Ordering::Relaxed);
        ended
    }

    fn ensure_min_size(&self) -> usize {
        let mut created = 0;
        while self.pool.is_open() && self.pool.size() < self.pool.min_size() {
            match self.pool.create(true) {
                Ok(Some(slot)) => {
                    self.pool.add_idle(slot);
                    created += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    error!(pool = %self.pool.name(), error = %e, "Could not restore pool to minimum size");
                    break;
                }
            }
        }
        if created > 0 {
            trace!(pool = %self.pool.name(), created, "Restored pool to minimum size");
        }
        created
    }
}

impl<T: Send + 'static> PruneTarget for Shared<T> {
    fn prune_name(&self) -> &str {
        self.pool.name()
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn prune(&self) {
        self.prune_pass();
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(id) = self.task.get_mut().take() {
            self.scheduler.deregister(id);
        }
    }
}

struct CancelOnDrop(Option<CancelToken>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.0.take() {
            token.cancel();
        }
    }
}
