//! Background scheduler running the periodic prune step of registered pools
//!
//! A [`PruneScheduler`] owns a single-worker tokio runtime that only exists
//! while at least one target is registered. Every target gets its own
//! interval task, and the prune step itself runs on the blocking pool so a
//! slow pool never delays the ticks of another.

use crate::errors::{PoolError, PoolResult};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, trace};

/// Something the scheduler can prune periodically
pub trait PruneTarget: Send + Sync + 'static {
    /// Name used when logging
    fn prune_name(&self) -> &str;

    /// A closed target is dropped from the schedule at its next tick
    fn is_closed(&self) -> bool;

    /// Run a single prune pass
    fn prune(&self);
}

/// Handle of a registered target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

struct State {
    runtime: Option<Runtime>,
    tasks: HashMap<TaskId, JoinHandle<()>>,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(runtime) = self.state.get_mut().runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Shared, reference counted prune scheduler.
///
/// Cloning yields another handle to the same scheduler. Registering the
/// first target starts the background thread, deregistering the last one
/// stops it.
///
/// # Examples
///
/// ```
/// use prunepool::{PruneScheduler, PruneTarget};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::time::Duration;
///
/// struct Ticks(AtomicUsize);
///
/// impl PruneTarget for Ticks {
///     fn prune_name(&self) -> &str { "ticks" }
///     fn is_closed(&self) -> bool { false }
///     fn prune(&self) { self.0.fetch_add(1, Ordering::Relaxed); }
/// }
///
/// let scheduler = PruneScheduler::new("doc-pruner");
/// let ticks = Arc::new(Ticks(AtomicUsize::new(0)));
/// let target: Arc<dyn PruneTarget> = ticks.clone();
/// let id = scheduler.register(Arc::downgrade(&target), Duration::from_millis(5)).unwrap();
/// assert!(scheduler.is_running());
///
/// std::thread::sleep(Duration::from_millis(50));
/// scheduler.deregister(id);
/// assert!(!scheduler.is_running());
/// assert!(ticks.0.load(Ordering::Relaxed) > 0);
/// ```
#[derive(Clone)]
pub struct PruneScheduler {
    inner: Arc<Inner>,
}

static SHARED: OnceLock<PruneScheduler> = OnceLock::new();

impl PruneScheduler {
    /// Create an independent scheduler, its worker thread is named after it
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    runtime: None,
                    tasks: HashMap::new(),
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The process-wide scheduler used when none is configured
    pub fn shared() -> Self {
        SHARED.get_or_init(|| PruneScheduler::new("pool-pruner")).clone()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Prune `target` every `interval` until it is deregistered, closed or dropped
    ///
    /// Fails with [`PoolError::InvalidConfiguration`] for a zero interval or
    /// one too large to schedule.
    pub fn register(&self, target: Weak<dyn PruneTarget>, interval: Duration) -> PoolResult<TaskId> {
        // A late tick is rescheduled one interval after it ran, so two intervals must fit.
        let start = Instant::now()
            .checked_add(interval)
            .filter(|start| !interval.is_zero() && start.checked_add(interval).is_some())
            .ok_or_else(|| {
                PoolError::InvalidConfiguration(format!(
                    "prune interval {interval:?} of scheduler {} cannot be scheduled",
                    self.inner.name
                ))
            })?;
        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.inner.state.lock();
        let runtime = match state.runtime.take() {
            Some(runtime) => runtime,
            None => {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name(self.inner.name.clone())
                    .enable_time()
                    .build()
                    .map_err(|source| PoolError::SchedulerStart {
                        scheduler: self.inner.name.clone(),
                        source,
                    })?;
                debug!(scheduler = %self.inner.name, "Prune scheduler started");
                runtime
            }
        };
        let handle = runtime.spawn(run(target, start, interval));
        state.runtime = Some(runtime);
        state.tasks.insert(id, handle);
        Ok(id)
    }

    /// Stop pruning a target. Returns false when it was not registered.
    pub fn deregister(&self, id: TaskId) -> bool {
        let mut state = self.inner.state.lock();
        let Some(handle) = state.tasks.remove(&id) else {
            return false;
        };
        handle.abort();
        let stopped = if state.tasks.is_empty() {
            state.runtime.take()
        } else {
            None
        };
        drop(state);
        if let Some(runtime) = stopped {
            runtime.shutdown_background();
            debug!(scheduler = %self.inner.name, "Prune scheduler stopped");
        }
        true
    }

    /// True while the background thread exists
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().runtime.is_some()
    }

    /// Number of registered targets
    pub fn size(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    pub fn is_registered(&self, id: TaskId) -> bool {
        self.inner.state.lock().tasks.contains_key(&id)
    }
}

impl fmt::Debug for PruneScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PruneScheduler")
            .field("name", &self.inner.name)
            .field("tasks", &self.size())
            .finish()
    }
}

async fn run(target: Weak<dyn PruneTarget>, start: Instant, interval: Duration) {
    let mut ticks = time::interval_at(start, interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        let Some(live) = target.upgrade() else {
            break;
        };
        if live.is_closed() {
            break;
        }
        let name = live.prune_name().to_string();
        trace!(pool = %name, "Running prune task");
        match task::spawn_blocking(move || live.prune()).await {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                error!(pool = %name, "Prune task panicked");
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    #[derive(Default)]
    struct Counter {
        runs: AtomicUsize,
        closed: AtomicBool,
        panics: bool,
    }

    impl PruneTarget for Counter {
        fn prune_name(&self) -> &str {
            "counter"
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn prune(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("prune failure");
            }
        }
    }

    fn register(scheduler: &PruneScheduler, counter: &Arc<Counter>, every: u64) -> TaskId {
        let target: Arc<dyn PruneTarget> = counter.clone();
        scheduler
            .register(Arc::downgrade(&target), Duration::from_millis(every))
            .unwrap()
    }

    #[test]
    fn test_starts_with_first_and_stops_with_last() {
        let scheduler = PruneScheduler::new("test-pruner");
        assert!(!scheduler.is_running());
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let id_a = register(&scheduler, &a, 5);
        let id_b = register(&scheduler, &b, 5);
        assert!(scheduler.is_running());
        assert_eq!(scheduler.size(), 2);

        assert!(scheduler.deregister(id_a));
        assert!(scheduler.is_running());
        assert!(scheduler.deregister(id_b));
        assert!(!scheduler.is_running());
        assert!(!scheduler.deregister(id_b));
    }

    #[test]
    fn test_runs_each_target_on_its_own_interval() {
        let scheduler = PruneScheduler::new("test-pruner");
        let fast = Arc::new(Counter::default());
        let slow = Arc::new(Counter::default());
        let fast_id = register(&scheduler, &fast, 5);
        let slow_id = register(&scheduler, &slow, 1_000);
        thread::sleep(Duration::from_millis(100));
        scheduler.deregister(fast_id);
        scheduler.deregister(slow_id);
        assert!(fast.runs.load(Ordering::SeqCst) >= 3);
        assert_eq!(slow.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_closed_target_is_skipped() {
        let scheduler = PruneScheduler::new("test-pruner");
        let counter = Arc::new(Counter::default());
        counter.closed.store(true, Ordering::SeqCst);
        let id = register(&scheduler, &counter, 5);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(counter.runs.load(Ordering::SeqCst), 0);
        scheduler.deregister(id);
    }

    #[test]
    fn test_panicking_target_keeps_schedule() {
        let scheduler = PruneScheduler::new("test-pruner");
        let counter = Arc::new(Counter {
            panics: true,
            ..Counter::default()
        });
        let id = register(&scheduler, &counter, 5);
        thread::sleep(Duration::from_millis(80));
        scheduler.deregister(id);
        assert!(counter.runs.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_restarts_after_stop() {
        let scheduler = PruneScheduler::new("test-pruner");
        let counter = Arc::new(Counter::default());
        let id = register(&scheduler, &counter, 5);
        scheduler.deregister(id);
        assert!(!scheduler.is_running());
        let id = register(&scheduler, &counter, 5);
        thread::sleep(Duration::from_millis(40));
        assert!(counter.runs.load(Ordering::SeqCst) > 0);
        scheduler.deregister(id);
    }

    #[test]
    fn test_unschedulable_interval_is_rejected() {
        let scheduler = PruneScheduler::new("test-pruner");
        let counter = Arc::new(Counter::default());
        let target: Arc<dyn PruneTarget> = counter.clone();
        for interval in [Duration::MAX, Duration::ZERO] {
            let err = scheduler
                .register(Arc::downgrade(&target), interval)
                .unwrap_err();
            assert!(matches!(err, PoolError::InvalidConfiguration(_)));
        }
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.size(), 0);
    }

    #[test]
    fn test_shared_is_one_instance() {
        let a = PruneScheduler::shared();
        let b = PruneScheduler::shared();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert_eq!(a.name(), "pool-pruner");
    }
}
