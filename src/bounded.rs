//! Size-bounded pool with admission control and lease tracking

use crate::basic::{BasicPool, pool_name};
use crate::cancel::CancelToken;
use crate::config::PoolConfiguration;
use crate::errors::{PoolError, PoolResult};
use crate::events::{PoolEventKind, PoolEvents};
use crate::factory::ResourceFactory;
use crate::health::HealthStatus;
use crate::lease::{IdleEntry, LeaseRecord, Pooled, Reclaim, ResourceId, Slot};
use crate::metrics::PoolMetrics;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// A LIFO pool that respects a minimum and maximum size.
///
/// The pool must be opened before it can be used. It keeps track of which
/// resources are idle and which are leased, and never lets the two together
/// exceed the maximum size.
///
/// # Examples
///
/// ```
/// use prunepool::{BoundedPool, FnFactory, PoolConfiguration};
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new().with_min_size(1).with_max_size(2);
/// let pool = BoundedPool::new(config, FnFactory::new(|| Ok(String::from("conn")))).unwrap();
/// pool.open().unwrap();
/// assert_eq!(pool.idle_size(), 1);
///
/// let a = pool.acquire_timeout(Duration::ZERO).unwrap();
/// let b = pool.acquire_timeout(Duration::ZERO).unwrap();
/// assert!(pool.acquire_timeout(Duration::from_millis(10)).is_err());
/// pool.release(a);
/// pool.release(b);
/// assert_eq!(pool.size(), 2);
/// ```
pub struct BoundedPool<T> {
    ledger: Arc<Ledger<T>>,
    min_size: usize,
    max_size: usize,
    sync_creation: bool,
    create_lock: Mutex<()>,
    opened: AtomicBool,
    peak_leased: AtomicUsize,
}

impl<T: Send + 'static> BoundedPool<T> {
    /// Create a new pool, it must be opened before use
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
            ledger: Arc::new(Ledger {
                base: BasicPool::with_name(name, config, factory),
                leased: DashMap::new(),
                res_count: AtomicUsize::new(0),
            }),
            min_size: config.min_size,
            max_size: config.max_size,
            sync_creation: config.sync_creation,
            create_lock: Mutex::new(()),
            opened: AtomicBool::new(false),
            peak_leased: AtomicUsize::new(0),
        }
    }

    /// Open the pool with `min_size` resources
    pub fn open(&self) -> PoolResult<()> {
        self.open_with(self.min_size)
    }

    /// Open the pool with the given amount of resources, bounded by min and max size.
    ///
    /// A creation failure is logged and the pool opens with what could be created.
    pub fn open_with(&self, amount: usize) -> PoolResult<()> {
        self.ledger.base.ensure_open()?;
        if self.opened.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let to_create = amount.clamp(self.min_size, self.max_size);
        for _ in 0..to_create {
            match self.create(true) {
                Ok(Some(slot)) => self.add_idle(slot),
                Ok(None) => break,
                Err(e) => {
                    error!(
                        pool = %self.name(),
                        wanted = to_create,
                        created = self.idle_size(),
                        error = %e,
                        "Could not create all resources while opening pool"
                    );
                    break;
                }
            }
        }
        self.ledger.base.fire(PoolEventKind::Opened, None);
        debug!(pool = %self.name(), size = self.size(), "Pool opened");
        Ok(())
    }

    /// Acquire a resource using the configured acquire timeout
    pub fn acquire(&self) -> PoolResult<Pooled<T>> {
        self.acquire_timeout(self.ledger.base.acquire_timeout_default())
    }

    /// Acquire a resource, waiting at most `timeout` for one to become available.
    ///
    /// Transient factory failures are absorbed: creation is attempted
    /// optimistically before and after waiting for an idle resource, and only
    /// the last attempt reports a creation error.
    pub fn acquire_timeout(&self, timeout: Duration) -> PoolResult<Pooled<T>> {
        self.acquire_with(timeout, None)
    }

    pub(crate) fn acquire_with(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> PoolResult<Pooled<T>> {
        self.ensure_usable()?;
        self.ledger.base.fire(PoolEventKind::Acquiring, None);
        let result = self.acquire_or_create(timeout, cancel);
        self.fire(PoolEventKind::Acquired, result.as_ref().ok().map(Pooled::id));
        result
    }

    fn acquire_or_create(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> PoolResult<Pooled<T>> {
        let deadline = Instant::now().checked_add(timeout);

        if self.size() < self.min_size {
            if let Some(slot) = self.create(false)? {
                return self.lease(slot, cancel);
            }
        }
        if let Some(entry) = self.ledger.base.take_idle(Duration::ZERO, cancel)? {
            return self.lease(entry.into_slot(), cancel);
        }
        if !self.is_full() {
            if let Some(slot) = self.create(false)? {
                return self.lease(slot, cancel);
            }
        }

        let remaining = deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
        if let Some(entry) = self.ledger.base.take_idle(remaining, cancel)? {
            return self.lease(entry.into_slot(), cancel);
        }
        self.ensure_usable()?;
        // Resources may have been evicted while waiting.
        if !self.is_full() {
            if let Some(slot) = self.create(true)? {
                return self.lease(slot, cancel);
            }
        }
        Err(PoolError::AcquireTimeout {
            pool: self.name().to_string(),
            timeout,
        })
    }

    /// Put a leased resource back in the pool.
    ///
    /// A resource that is not leased from this pool (evicted, or foreign) is
    /// destroyed instead, and a foreign pool stops counting it. Returns true
    /// when the resource became idle.
    pub fn release(&self, lease: Pooled<T>) -> bool {
        let slot = if self.is_leased(lease.id()) {
            lease.into_slot()
        } else {
            lease.detach()
        };
        self.ledger.reclaim(slot)
    }

    /// Remove an idle resource from the pool and destroy it.
    /// Returns false when the resource was not idle.
    pub fn evict_idle(&self, id: ResourceId) -> bool {
        self.remove_idle(id, false)
    }

    /// Stop tracking a leased resource.
    ///
    /// The pool does not hold a leased resource, so it cannot destroy it now.
    /// With `destroy` the lease token is cancelled to tell the leaser to stop
    /// using it. Either way the resource is destroyed when it is released.
    pub fn evict_leased(&self, id: ResourceId, destroy: bool) -> bool {
        self.remove_leased(id, destroy, false).is_some()
    }

    /// Destroy all idle resources and evict all leased resources.
    /// Returns the number of resources removed from the pool.
    pub fn flush(&self) -> usize {
        let evicted = self.evict_all_leased();
        let idle = self.ledger.base.idle().drain();
        let drained = idle.len();
        for entry in idle {
            self.ledger.res_count.fetch_sub(1, Ordering::SeqCst);
            self.ledger.base.destroy(entry.id, entry.value);
        }
        evicted + drained
    }

    /// Close the pool. Idle resources are destroyed, leased resources are
    /// destroyed when they are released.
    pub fn close(&self) {
        if !self.ledger.base.mark_closed() {
            return;
        }
        for entry in self.ledger.base.idle().close() {
            self.ledger.res_count.fetch_sub(1, Ordering::SeqCst);
            self.ledger.base.destroy(entry.id, entry.value);
        }
        self.evict_all_leased();
        self.ledger.base.fire(PoolEventKind::Closed, None);
        debug!(pool = %self.name(), "Pool closed");
    }

    fn evict_all_leased(&self) -> usize {
        let ids: Vec<ResourceId> = self.ledger.leased.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter(|id| self.remove_leased(*id, false, false).is_some())
            .count()
    }

    pub(crate) fn ensure_usable(&self) -> PoolResult<()> {
        self.ledger.base.ensure_open()?;
        if !self.opened.load(Ordering::SeqCst) {
            return Err(PoolError::NotOpened {
                pool: self.name().to_string(),
            });
        }
        Ok(())
    }

    /// Create a resource if the pool is not full.
    ///
    /// A slot is reserved before the factory is called and given back when
    /// creation fails, so concurrent creators never overshoot `max_size`.
    /// Factory errors are returned with `surface_errors`, logged otherwise.
    pub(crate) fn create(&self, surface_errors: bool) -> PoolResult<Option<Slot<T>>> {
        let _gate = self.sync_creation.then(|| self.create_lock.lock());
        let reserved = self.ledger.res_count.fetch_add(1, Ordering::SeqCst) + 1;
        if reserved > self.max_size {
            self.ledger.res_count.fetch_sub(1, Ordering::SeqCst);
            return Ok(None);
        }
        match self.ledger.base.create_slot() {
            Ok(slot) => Ok(Some(slot)),
            Err(e) => {
                self.ledger.res_count.fetch_sub(1, Ordering::SeqCst);
                if surface_errors {
                    Err(e)
                } else {
                    error!(pool = %self.name(), error = %e, "Failed to create a new resource");
                    Ok(None)
                }
            }
        }
    }

    /// Register a counted resource as leased.
    pub(crate) fn lease(&self, slot: Slot<T>, cancel: Option<&CancelToken>) -> PoolResult<Pooled<T>> {
        let token = cancel.cloned().unwrap_or_default();
        self.ledger
            .leased
            .insert(slot.id, LeaseRecord::new(slot.created_at, token.clone()));
        self.peak_leased
            .fetch_max(self.ledger.leased.len(), Ordering::Relaxed);
        if self.ledger.base.is_closed() {
            if self.ledger.leased.remove(&slot.id).is_some() {
                self.ledger.res_count.fetch_sub(1, Ordering::SeqCst);
            }
            self.ledger.base.destroy(slot.id, slot.value);
            return Err(PoolError::Closed {
                pool: self.name().to_string(),
            });
        }
        let home: Weak<dyn Reclaim<T>> = Arc::downgrade(&self.ledger) as Weak<Ledger<T>>;
        Ok(Pooled::new(slot, token, home))
    }

    /// Add a counted resource to the idle queue.
    pub(crate) fn add_idle(&self, slot: Slot<T>) {
        if let Err(entry) = self.ledger.base.idle().push(IdleEntry::from_slot(slot)) {
            self.ledger.res_count.fetch_sub(1, Ordering::SeqCst);
            self.ledger.base.destroy(entry.id, entry.value);
        }
    }

    pub(crate) fn remove_idle(&self, id: ResourceId, idle_expired: bool) -> bool {
        match self.ledger.base.idle().remove(id) {
            Some(entry) => {
                self.discard_idle(entry, idle_expired);
                true
            }
            None => false,
        }
    }

    /// Remove the longest idle resource when `expired` says so.
    pub(crate) fn remove_oldest_idle_if(&self, expired: impl FnOnce(&IdleEntry<T>) -> bool) -> bool {
        match self.ledger.base.idle().pop_oldest_if(expired) {
            Some(entry) => {
                self.discard_idle(entry, true);
                true
            }
            None => false,
        }
    }

    fn discard_idle(&self, entry: IdleEntry<T>, idle_expired: bool) {
        self.ledger.res_count.fetch_sub(1, Ordering::SeqCst);
        debug!(pool = %self.name(), resource = %entry.id, "Removed idle resource from pool");
        if idle_expired {
            self.ledger.base.fire(PoolEventKind::IdleExpired, Some(entry.id));
        }
        self.ledger.base.destroy(entry.id, entry.value);
    }

    pub(crate) fn remove_leased(
        &self,
        id: ResourceId,
        destroy: bool,
        lease_expired: bool,
    ) -> Option<LeaseRecord> {
        let (_, record) = self.ledger.leased.remove(&id)?;
        self.ledger.res_count.fetch_sub(1, Ordering::SeqCst);
        debug!(pool = %self.name(), resource = %id, "Evicted leased resource from pool");
        if lease_expired {
            self.ledger.base.fire(PoolEventKind::LeaseExpired, Some(id));
        }
        if destroy {
            record.token.cancel();
        }
        Some(record)
    }

    /// Remove a lease the caller handed back as unusable and destroy the resource.
    pub(crate) fn discard(&self, lease: Pooled<T>) {
        let slot = lease.into_slot();
        if self.ledger.leased.remove(&slot.id).is_some() {
            self.ledger.res_count.fetch_sub(1, Ordering::SeqCst);
        }
        self.ledger.base.destroy(slot.id, slot.value);
    }

    pub(crate) fn validate(&self, value: &T) -> bool {
        self.ledger.base.validate(value)
    }

    pub(crate) fn fire(&self, kind: PoolEventKind, resource: Option<ResourceId>) {
        self.ledger.base.fire(kind, resource);
    }
}

/// Lease bookkeeping shared with the leases, so a dropped lease finds its way back.
struct Ledger<T> {
    base: BasicPool<T>,
    leased: DashMap<ResourceId, LeaseRecord>,
    /// Resources in the pool or being created for it.
    res_count: AtomicUsize,
}

impl<T: Send + 'static> Reclaim<T> for Ledger<T> {
    fn reclaim(&self, slot: Slot<T>) -> bool {
        self.base.fire(PoolEventKind::Releasing, Some(slot.id));
        if self.leased.remove(&slot.id).is_none() {
            // Common after a flush or an expired lease.
            debug!(pool = %self.base.name(), resource = %slot.id, "Released resource is not leased from pool");
            self.base.destroy(slot.id, slot.value);
            return false;
        }
        match self.base.idle().push(IdleEntry::from_slot(slot)) {
            Ok(()) => true,
            Err(entry) => {
                self.res_count.fetch_sub(1, Ordering::SeqCst);
                self.base.destroy(entry.id, entry.value);
                false
            }
        }
    }

    fn forget(&self, id: ResourceId) {
        if self.leased.remove(&id).is_some() {
            self.res_count.fetch_sub(1, Ordering::SeqCst);
            debug!(pool = %self.base.name(), resource = %id, "Leased resource taken out of pool");
        }
    }
}

impl<T> BoundedPool<T> {
    pub fn name(&self) -> &str {
        self.ledger.base.name()
    }

    pub fn events(&self) -> &PoolEvents {
        self.ledger.base.events()
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of idle plus leased resources
    pub fn size(&self) -> usize {
        self.ledger.res_count.load(Ordering::SeqCst).min(self.max_size)
    }

    pub fn is_full(&self) -> bool {
        self.ledger.res_count.load(Ordering::SeqCst) >= self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.ledger.res_count.load(Ordering::SeqCst) == 0
    }

    pub fn idle_size(&self) -> usize {
        self.ledger.base.idle_size()
    }

    pub fn leased_size(&self) -> usize {
        self.ledger.leased.len()
    }

    pub fn waiting_size(&self) -> usize {
        self.ledger.base.waiting_size()
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst) && !self.ledger.base.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.ledger.base.is_closed()
    }

    pub fn created_count(&self) -> u64 {
        self.ledger.base.created_count()
    }

    pub fn destroyed_count(&self) -> u64 {
        self.ledger.base.destroyed_count()
    }

    pub fn acquire_timeout_default(&self) -> Duration {
        self.ledger.base.acquire_timeout_default()
    }

    pub fn is_leased(&self, id: ResourceId) -> bool {
        self.ledger.leased.contains_key(&id)
    }

    pub fn idle_ids(&self) -> Vec<ResourceId> {
        self.ledger.base.idle().ids()
    }

    pub(crate) fn set_lease_end(&self, id: ResourceId, lease_end: Option<Instant>) {
        if let Some(mut record) = self.ledger.leased.get_mut(&id) {
            record.lease_end = lease_end;
        }
    }

    pub(crate) fn expired_leases(&self, now: Instant) -> Vec<ResourceId> {
        self.ledger.leased
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| *e.key())
            .collect()
    }

    pub(crate) fn leased_created_before(&self, cutoff: Instant) -> Vec<ResourceId> {
        self.ledger.leased
            .iter()
            .filter(|e| e.value().created_at < cutoff)
            .map(|e| *e.key())
            .collect()
    }

    pub(crate) fn idle_created_before(&self, cutoff: Instant) -> Vec<ResourceId> {
        self.ledger.base.idle().created_before(cutoff)
    }

    /// Current counters and sizes
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            created: self.created_count(),
            destroyed: self.destroyed_count(),
            idle_resources: self.idle_size(),
            leased_resources: self.leased_size(),
            waiting_callers: self.waiting_size(),
            peak_leased: self.peak_leased.load(Ordering::Relaxed),
            peak_waiting: self.ledger.base.idle().peak_waiting(),
            size: self.size(),
            min_size: self.min_size,
            max_size: self.max_size,
            ..PoolMetrics::default()
        }
    }

    pub fn health_status(&self) -> HealthStatus {
        HealthStatus::from_metrics(&self.metrics())
    }
}
