//! Keyed registry of pruned pools, created on demand and removed when unused

use crate::config::{PoolConfiguration, RegistryConfiguration};
use crate::errors::{PoolError, PoolResult};
use crate::factory::{ResourceFactory, guarded};
use crate::lease::Pooled;
use crate::pruned::PrunedPool;
use crate::scheduler::{PruneScheduler, PruneTarget, TaskId};

use dashmap::DashMap;
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

static REGISTRY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Creates the pool for a key and disposes of resources that have no pool.
pub trait RegistryFactory<K, T>: Send + Sync {
    /// Create an opened pool for `key`, pruned by `scheduler`
    fn create_pool(&self, key: &K, scheduler: &PruneScheduler) -> PoolResult<PrunedPool<T>>;

    /// Destroy a resource released for a key that no longer has a pool
    fn destroy(&self, _key: &K, resource: T) {
        drop(resource);
    }
}

/// Registry factory creating every pool from one configuration
///
/// The pool name is the configured name followed by the key.
///
/// # Examples
///
/// ```
/// use prunepool::{FnFactory, KeyedPoolFactory, PoolConfiguration, PoolRegistry, ResourceFactory};
/// use std::sync::Arc;
///
/// let config = PoolConfiguration::new().with_name("hosts").with_max_size(2);
/// let factory = KeyedPoolFactory::new(config, |host: &String| {
///     let host = host.clone();
///     Arc::new(FnFactory::new(move || Ok(format!("connection to {host}")))) as Arc<dyn ResourceFactory<String>>
/// });
/// let registry = PoolRegistry::new(factory);
/// let conn = registry.acquire(&"db1".to_string()).unwrap();
/// assert_eq!(*conn, "connection to db1");
/// registry.release(&"db1".to_string(), conn);
/// registry.close();
/// ```
pub struct KeyedPoolFactory<K, T> {
    config: PoolConfiguration,
    factory: Box<dyn Fn(&K) -> Arc<dyn ResourceFactory<T>> + Send + Sync>,
}

impl<K, T> KeyedPoolFactory<K, T> {
    pub fn new<F>(config: PoolConfiguration, factory: F) -> Self
    where
        F: Fn(&K) -> Arc<dyn ResourceFactory<T>> + Send + Sync + 'static,
    {
        Self {
            config,
            factory: Box::new(factory),
        }
    }
}

impl<K: fmt::Debug, T: Send + 'static> RegistryFactory<K, T> for KeyedPoolFactory<K, T> {
    fn create_pool(&self, key: &K, scheduler: &PruneScheduler) -> PoolResult<PrunedPool<T>> {
        let mut config = self.config.clone();
        let name = config.name.take().unwrap_or_else(|| "pool".to_string());
        config.name = Some(format!("{name}[{key:?}]"));
        let pool = PrunedPool::with_scheduler(config, (self.factory)(key), scheduler.clone())?;
        pool.open()?;
        Ok(pool)
    }

    fn destroy(&self, key: &K, resource: T) {
        let factory = (self.factory)(key);
        if let Err(e) = guarded(|| factory.destroy(resource)) {
            error!(key = ?key, error = %e, "Pool factory failed to destroy resource");
        }
    }
}

type UsageGuard = ArcRwLockReadGuard<RawRwLock, ()>;

/// A pool in the registry plus the lock that keeps it from being removed while used.
struct SubPool<T> {
    pool: PrunedPool<T>,
    usage: Arc<RwLock<()>>,
}

struct RegistryShared<K, T> {
    name: Arc<str>,
    pools: DashMap<K, Arc<SubPool<T>>>,
    factory: Box<dyn RegistryFactory<K, T>>,
    scheduler: PruneScheduler,
    cleaner: PruneScheduler,
    clean_interval: Duration,
    create_lock: Mutex<()>,
    closed: AtomicBool,
    clean_task: Mutex<Option<TaskId>>,
}

/// A map of pools, one per key.
///
/// The pool for a key is created by the [`RegistryFactory`] on first use.
/// A clean task removes and closes pools that are empty and not in use, so
/// pool configurations with idle expiry let unused keys disappear.
///
/// `PoolRegistry` is a cheap handle: clones share the same registry.
pub struct PoolRegistry<K, T> {
    shared: Arc<RegistryShared<K, T>>,
}

impl<K, T> Clone for PoolRegistry<K, T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, T> PoolRegistry<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Send + 'static,
{
    /// Create and open a registry with default configuration
    pub fn new<F>(factory: F) -> Self
    where
        F: RegistryFactory<K, T> + 'static,
    {
        let registry = Self::unopened(RegistryConfiguration::default(), factory);
        if let Err(e) = registry.open() {
            error!(registry = %registry.name(), error = %e, "Could not schedule registry clean task");
        }
        registry
    }

    /// Create a registry, call [`open`](Self::open) to start the clean task
    pub fn with_config<F>(config: RegistryConfiguration, factory: F) -> Self
    where
        F: RegistryFactory<K, T> + 'static,
    {
        Self::unopened(config, factory)
    }

    fn unopened<F>(config: RegistryConfiguration, factory: F) -> Self
    where
        F: RegistryFactory<K, T> + 'static,
    {
        let name: Arc<str> = match config.name {
            Some(name) if !name.is_empty() => Arc::from(name),
            _ => Arc::from(format!(
                "registry-{}",
                REGISTRY_COUNTER.fetch_add(1, Ordering::Relaxed)
            )),
        };
        let cleaner = config
            .cleaner
            .unwrap_or_else(|| PruneScheduler::new(format!("{name}-cleaner")));
        Self {
            shared: Arc::new(RegistryShared {
                pools: DashMap::new(),
                factory: Box::new(factory),
                scheduler: config.scheduler.unwrap_or_else(PruneScheduler::shared),
                cleaner,
                clean_interval: config.clean_interval,
                create_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
                clean_task: Mutex::new(None),
                name,
            }),
        }
    }

    /// Start the clean task
    pub fn open(&self) -> PoolResult<()> {
        self.ensure_not_closed()?;
        let mut task = self.shared.clean_task.lock();
        if task.is_none() {
            let target: Weak<RegistryShared<K, T>> = Arc::downgrade(&self.shared);
            let target: Weak<dyn PruneTarget> = target;
            *task = Some(self.shared.cleaner.register(target, self.shared.clean_interval)?);
            debug!(registry = %self.name(), "Pool registry opened");
        }
        Ok(())
    }

    /// Acquire a resource from the pool for `key`, creating the pool if needed
    pub fn acquire(&self, key: &K) -> PoolResult<Pooled<T>> {
        let (sub, _using) = self.lease_pool(key)?;
        sub.pool.acquire()
    }

    pub fn acquire_timeout(&self, key: &K, timeout: Duration) -> PoolResult<Pooled<T>> {
        let (sub, _using) = self.lease_pool(key)?;
        sub.pool.acquire_timeout(timeout)
    }

    /// Acquire with a lease time of its own, see [`PrunedPool::acquire_leased`]
    pub fn acquire_leased(
        &self,
        key: &K,
        timeout: Duration,
        lease_time: Option<Duration>,
    ) -> PoolResult<Pooled<T>> {
        let (sub, _using) = self.lease_pool(key)?;
        sub.pool.acquire_leased(timeout, lease_time)
    }

    /// Release a resource to the pool for `key`.
    /// Without a pool the resource goes to [`RegistryFactory::destroy`].
    pub fn release(&self, key: &K, lease: Pooled<T>) {
        match self.pool(key) {
            Some(pool) => {
                pool.release(lease);
            }
            None => {
                debug!(registry = %self.name(), key = ?key, "No pool available to release resource");
                self.shared.factory.destroy(key, lease.into_inner());
            }
        }
    }

    /// A pool with a usage guard held. The clean task skips pools that are in use.
    fn lease_pool(&self, key: &K) -> PoolResult<(Arc<SubPool<T>>, UsageGuard)> {
        loop {
            self.ensure_not_closed()?;
            let existing = self.shared.pools.get(key).map(|e| Arc::clone(e.value()));
            let (sub, using) = match existing {
                Some(sub) => {
                    let using = sub.usage.read_arc();
                    (sub, using)
                }
                None => self.create_pool(key)?,
            };
            if !sub.pool.is_closed() {
                return Ok((sub, using));
            }
            drop(using);
            self.ensure_not_closed()?;
            let removed = self
                .shared
                .pools
                .remove_if(key, |_, current| Arc::ptr_eq(current, &sub));
            if removed.is_some() {
                warn!(registry = %self.name(), key = ?key, "Removed closed pool from registry");
            }
        }
    }

    fn create_pool(&self, key: &K) -> PoolResult<(Arc<SubPool<T>>, UsageGuard)> {
        let _creating = self.shared.create_lock.lock();
        self.ensure_not_closed()?;
        if let Some(sub) = self.shared.pools.get(key).map(|e| Arc::clone(e.value())) {
            let using = sub.usage.read_arc();
            return Ok((sub, using));
        }
        let pool = self.shared.factory.create_pool(key, &self.shared.scheduler)?;
        let sub = Arc::new(SubPool {
            pool,
            usage: Arc::new(RwLock::new(())),
        });
        // Guard first, so the clean task cannot remove the new, empty pool.
        let using = sub.usage.read_arc();
        self.shared.pools.insert(key.clone(), Arc::clone(&sub));
        debug!(registry = %self.name(), key = ?key, pool = %sub.pool.name(), "Created pool for key");
        Ok((sub, using))
    }

    /// Remove and close pools that are empty and not in use.
    /// Returns the number of pools removed.
    pub fn clean(&self) -> usize {
        self.shared.clean()
    }

    /// Stop the clean task and close all pools.
    ///
    /// Pools stay in the registry so that resources released after closing
    /// reach their (closed) pool and are destroyed there.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self.shared.clean_task.lock().take() {
            self.shared.cleaner.deregister(id);
        }
        let pools: Vec<Arc<SubPool<T>>> = {
            let _creating = self.shared.create_lock.lock();
            self.shared.pools.iter().map(|e| Arc::clone(e.value())).collect()
        };
        for sub in pools {
            sub.pool.close();
        }
        debug!(registry = %self.name(), "Pool registry closed");
    }
}

impl<K, T> PoolRegistry<K, T>
where
    K: Eq + Hash + Clone,
{
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The pool for `key`, if there is one
    pub fn pool(&self, key: &K) -> Option<PrunedPool<T>> {
        self.shared.pools.get(key).map(|e| e.value().pool.clone())
    }

    /// Number of pools
    pub fn pool_count(&self) -> usize {
        self.shared.pools.len()
    }

    pub fn keys(&self) -> Vec<K> {
        self.shared.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.pools.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.shared.clean_task.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Scheduler pruning the pools of this registry
    pub fn scheduler(&self) -> &PruneScheduler {
        &self.shared.scheduler
    }

    fn ensure_not_closed(&self) -> PoolResult<()> {
        if self.is_closed() {
            return Err(PoolError::RegistryClosed {
                registry: self.name().to_string(),
            });
        }
        Ok(())
    }
}

impl<K, T> RegistryShared<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: Send + 'static,
{
    fn clean(&self) -> usize {
        if self.closed.load(Ordering::SeqCst) {
            return 0;
        }
        let candidates: Vec<(K, Arc<SubPool<T>>)> = self
            .pools
            .iter()
            .filter(|e| e.value().pool.is_empty())
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut removed = 0;
        for (key, sub) in candidates {
            let Some(_unused) = sub.usage.try_write() else {
                continue;
            };
            if !sub.pool.is_empty() {
                continue;
            }
            if self
                .pools
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &sub))
                .is_some()
            {
                sub.pool.close();
                removed += 1;
                debug!(registry = %self.name, key = ?key, "Removed pool for key");
            }
        }
        trace!(registry = %self.name, removed, remaining = self.pools.len(), "Cleaned pool registry");
        removed
    }
}

impl<K, T> PruneTarget for RegistryShared<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Send + 'static,
{
    fn prune_name(&self) -> &str {
        &self.name
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn prune(&self) {
        self.clean();
    }
}

impl<K, T> Drop for RegistryShared<K, T> {
    fn drop(&mut self) {
        if let Some(id) = self.clean_task.get_mut().take() {
            self.cleaner.deregister(id);
        }
    }
}
