//! Unbounded LIFO pool

use crate::cancel::CancelToken;
use crate::config::PoolConfiguration;
use crate::errors::{PoolError, PoolResult};
use crate::events::{PoolEventKind, PoolEvents};
use crate::factory::{ResourceFactory, guarded};
use crate::idle::{IdleQueue, Interrupted};
use crate::lease::{IdleEntry, Pooled, Reclaim, ResourceId, Slot};

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error};

static POOL_COUNTER: AtomicU64 = AtomicU64::new(0);
/// Ids are unique across all pools of the process.
static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn pool_name(config: &PoolConfiguration) -> Arc<str> {
    match &config.name {
        Some(name) if !name.is_empty() => Arc::from(name.as_str()),
        _ => Arc::from(format!("pool-{}", POOL_COUNTER.fetch_add(1, Ordering::Relaxed))),
    }
}

/// A pool that re-uses resources but never limits how many exist.
///
/// Only idle resources are tracked. When no idle resource becomes available
/// within the acquire timeout, a new one is created.
///
/// # Examples
///
/// ```
/// use prunepool::{BasicPool, FnFactory, PoolConfiguration};
/// use std::time::Duration;
///
/// let pool = BasicPool::new(PoolConfiguration::new(), FnFactory::new(|| Ok(vec![0u8; 16]))).unwrap();
/// let buffer = pool.acquire_timeout(Duration::ZERO).unwrap();
/// assert_eq!(buffer.len(), 16);
/// pool.release(buffer);
/// assert_eq!(pool.idle_size(), 1);
/// ```
pub struct BasicPool<T> {
    core: Arc<Core<T>>,
}

struct Core<T> {
    name: Arc<str>,
    factory: Arc<dyn ResourceFactory<T>>,
    idle: IdleQueue<T>,
    events: PoolEvents,
    closed: AtomicBool,
    acquire_timeout: Duration,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl<T: Send + 'static> BasicPool<T> {
    /// Create a new pool with the given resource factory
    pub fn new<F>(config: PoolConfiguration, factory: F) -> PoolResult<Self>
    where
        F: ResourceFactory<T> + 'static,
    {
        config.validate()?;
        Ok(Self::with_name(pool_name(&config), &config, Arc::new(factory)))
    }

    pub(crate) fn with_name(
        name: Arc<str>,
        config: &PoolConfiguration,
        factory: Arc<dyn ResourceFactory<T>>,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                events: PoolEvents::new(Arc::clone(&name)),
                name,
                factory,
                idle: IdleQueue::new(config.fair),
                closed: AtomicBool::new(false),
                acquire_timeout: config.acquire_timeout,
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a resource using the configured acquire timeout
    pub fn acquire(&self) -> PoolResult<Pooled<T>> {
        self.acquire_timeout(self.core.acquire_timeout)
    }

    /// Take an idle resource within `timeout`, or create a new one
    pub fn acquire_timeout(&self, timeout: Duration) -> PoolResult<Pooled<T>> {
        self.ensure_open()?;
        self.fire(PoolEventKind::Acquiring, None);
        let result = self.acquire_or_create(timeout);
        self.fire(PoolEventKind::Acquired, result.as_ref().ok().map(Pooled::id));
        result
    }

    fn acquire_or_create(&self, timeout: Duration) -> PoolResult<Pooled<T>> {
        if let Some(entry) = self.take_idle(timeout, None)? {
            return self.lease(entry.into_slot());
        }
        self.ensure_open()?;
        let slot = self.create_slot()?;
        self.lease(slot)
    }

    /// Hand out a resource, unless the pool was closed in the meantime.
    fn lease(&self, slot: Slot<T>) -> PoolResult<Pooled<T>> {
        if self.is_closed() {
            self.destroy(slot.id, slot.value);
            return Err(PoolError::Closed {
                pool: self.core.name.to_string(),
            });
        }
        let home: Weak<dyn Reclaim<T>> = Arc::downgrade(&self.core) as Weak<Core<T>>;
        Ok(Pooled::new(slot, CancelToken::new(), home))
    }

    /// Put the resource at the head of the idle queue
    pub fn release(&self, lease: Pooled<T>) {
        self.core.reclaim(lease.into_slot());
    }

    /// Close the pool and destroy all idle resources
    pub fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        for entry in self.core.idle.close() {
            self.destroy(entry.id, entry.value);
        }
        self.fire(PoolEventKind::Closed, None);
        debug!(pool = %self.core.name, "Pool closed");
    }

    pub(crate) fn ensure_open(&self) -> PoolResult<()> {
        if self.is_closed() {
            return Err(PoolError::Closed {
                pool: self.core.name.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn take_idle(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> PoolResult<Option<IdleEntry<T>>> {
        self.core
            .idle
            .take(timeout, cancel)
            .map_err(|Interrupted| PoolError::Interrupted {
                pool: self.core.name.to_string(),
            })
    }

    /// Ask the factory for a new resource
    pub(crate) fn create_slot(&self) -> PoolResult<Slot<T>> {
        let core = &self.core;
        let value = guarded(|| core.factory.create()).map_err(|source| PoolError::Creation {
            pool: core.name.to_string(),
            source,
        })?;
        let id = ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed));
        core.created.fetch_add(1, Ordering::Relaxed);
        self.fire(PoolEventKind::Created, Some(id));
        Ok(Slot {
            id,
            value,
            created_at: Instant::now(),
        })
    }

    /// Hand a resource to the factory for destruction, logging failures
    pub(crate) fn destroy(&self, id: ResourceId, value: T) {
        self.core.destroy(id, value);
    }

    /// Run the factory validation, a panicking validator counts as invalid
    pub(crate) fn validate(&self, value: &T) -> bool {
        let core = &self.core;
        match guarded(|| Ok(core.factory.is_valid(value))) {
            Ok(valid) => valid,
            Err(e) => {
                error!(pool = %core.name, error = %e, "Pool factory failed to validate resource");
                false
            }
        }
    }

    pub(crate) fn fire(&self, kind: PoolEventKind, resource: Option<ResourceId>) {
        self.core.events.fire(kind, resource);
    }
}

impl<T> BasicPool<T> {
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Listener registry of this pool
    pub fn events(&self) -> &PoolEvents {
        &self.core.events
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.core.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn idle(&self) -> &IdleQueue<T> {
        &self.core.idle
    }

    /// Number of idle resources (the available permits)
    pub fn idle_size(&self) -> usize {
        self.core.idle.len()
    }

    /// Number of callers blocked in acquire
    pub fn waiting_size(&self) -> usize {
        self.core.idle.waiting()
    }

    pub fn created_count(&self) -> u64 {
        self.core.created.load(Ordering::Relaxed)
    }

    pub fn destroyed_count(&self) -> u64 {
        self.core.destroyed.load(Ordering::Relaxed)
    }

    pub fn acquire_timeout_default(&self) -> Duration {
        self.core.acquire_timeout
    }
}

impl<T: Send + 'static> Core<T> {
    fn destroy(&self, id: ResourceId, value: T) {
        self.events.fire(PoolEventKind::Destroying, Some(id));
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = guarded(|| self.factory.destroy(value)) {
            error!(pool = %self.name, resource = %id, error = %e, "Pool factory failed to destroy resource");
        }
    }
}

impl<T: Send + 'static> Reclaim<T> for Core<T> {
    fn reclaim(&self, slot: Slot<T>) -> bool {
        self.events.fire(PoolEventKind::Releasing, Some(slot.id));
        match self.idle.push(IdleEntry::from_slot(slot)) {
            Ok(()) => true,
            Err(entry) => {
                debug!(pool = %self.name, resource = %entry.id, "Released resource to closed pool");
                self.destroy(entry.id, entry.value);
                false
            }
        }
    }

    // Idle resources are the only ones tracked.
    fn forget(&self, _id: ResourceId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventRecorder;
    use crate::factory::testing::CountingFactory;

    fn pool(factory: &Arc<CountingFactory>) -> BasicPool<usize> {
        BasicPool::new(PoolConfiguration::new().with_name("basic"), Arc::clone(factory)).unwrap()
    }

    #[test]
    fn test_reuses_released_resource() {
        let factory = CountingFactory::shared();
        let pool = pool(&factory);
        let first = pool.acquire_timeout(Duration::ZERO).unwrap();
        let value = *first;
        pool.release(first);
        let again = pool.acquire_timeout(Duration::ZERO).unwrap();
        assert_eq!(*again, value);
        assert_eq!(factory.created(), 1);
    }

    #[test]
    fn test_creates_without_bound() {
        let factory = CountingFactory::shared();
        let pool = pool(&factory);
        let leases: Vec<_> = (0..10)
            .map(|_| pool.acquire_timeout(Duration::ZERO).unwrap())
            .collect();
        assert_eq!(factory.created(), 10);
        for lease in leases {
            pool.release(lease);
        }
        assert_eq!(pool.idle_size(), 10);
    }

    #[test]
    fn test_most_recently_released_first() {
        let factory = CountingFactory::shared();
        let pool = pool(&factory);
        let a = pool.acquire_timeout(Duration::ZERO).unwrap();
        let b = pool.acquire_timeout(Duration::ZERO).unwrap();
        let b_value = *b;
        pool.release(a);
        pool.release(b);
        assert_eq!(*pool.acquire_timeout(Duration::ZERO).unwrap(), b_value);
    }

    #[test]
    fn test_creation_failure_surfaces() {
        let factory = CountingFactory::shared();
        factory.set_failing(true);
        let pool = pool(&factory);
        let err = pool.acquire_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, PoolError::Creation { .. }));
    }

    #[test]
    fn test_closed_pool_fails_fast_and_destroys_idle() {
        let factory = CountingFactory::shared();
        let pool = pool(&factory);
        let lease = pool.acquire_timeout(Duration::ZERO).unwrap();
        let other = pool.acquire_timeout(Duration::ZERO).unwrap();
        pool.release(lease);
        pool.close();
        assert_eq!(factory.destroyed(), 1);
        assert!(pool.acquire_timeout(Duration::ZERO).unwrap_err().is_closed());
        pool.release(other);
        assert_eq!(factory.destroyed(), 2);
    }

    #[test]
    fn test_dropped_lease_becomes_idle() {
        let factory = CountingFactory::shared();
        let pool = pool(&factory);
        let lease = pool.acquire_timeout(Duration::ZERO).unwrap();
        drop(lease);
        assert_eq!(pool.idle_size(), 1);
        assert_eq!(factory.destroyed(), 0);
    }

    #[test]
    fn test_resource_taken_while_closing_is_destroyed() {
        let factory = CountingFactory::shared();
        let pool = pool(&factory);
        let lease = pool.acquire_timeout(Duration::ZERO).unwrap();
        pool.release(lease);

        // closed flag set, idle queue not closed yet
        assert!(pool.mark_closed());
        let entry = pool.take_idle(Duration::ZERO, None).unwrap().unwrap();
        let err = pool.lease(entry.into_slot()).unwrap_err();
        assert!(err.is_closed());
        assert_eq!(factory.destroyed(), 1);
    }

    #[test]
    fn test_lifecycle_events() {
        let factory = CountingFactory::shared();
        let pool = pool(&factory);
        let recorder = Arc::new(EventRecorder::new());
        pool.events().add_listener(recorder.clone());
        let lease = pool.acquire_timeout(Duration::ZERO).unwrap();
        pool.release(lease);
        pool.close();
        let kinds: Vec<_> = recorder.take().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                PoolEventKind::Acquiring,
                PoolEventKind::Created,
                PoolEventKind::Acquired,
                PoolEventKind::Releasing,
                PoolEventKind::Destroying,
                PoolEventKind::Closed,
            ]
        );
    }
}
