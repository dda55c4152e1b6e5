//! Lifecycle events and listeners
//!
//! Every pool owns a [`PoolEvents`] dispatcher. Listeners declare which
//! [`PoolEventKind`]s they care about; the dispatcher keeps the union of
//! those interests so that events nobody listens to are never built.

use crate::lease::ResourceId;
use crossbeam::queue::SegQueue;
use parking_lot::RwLock;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::SystemTime;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolEventKind {
    /// Pool is opened
    Opened,
    /// Created a new resource
    Created,
    /// About to acquire a resource from the pool
    Acquiring,
    /// Acquired a resource, or failed to (no resource attached)
    Acquired,
    /// About to release a resource to the pool
    Releasing,
    /// About to destroy a resource
    Destroying,
    /// Pool is closed
    Closed,
    /// Resource removed because it was idle for too long
    IdleExpired,
    /// Resource removed because its lease expired
    LeaseExpired,
    /// Resource removed because the factory reported it invalid
    Invalid,
}

impl PoolEventKind {
    pub const ALL: [PoolEventKind; 10] = [
        PoolEventKind::Opened,
        PoolEventKind::Created,
        PoolEventKind::Acquiring,
        PoolEventKind::Acquired,
        PoolEventKind::Releasing,
        PoolEventKind::Destroying,
        PoolEventKind::Closed,
        PoolEventKind::IdleExpired,
        PoolEventKind::LeaseExpired,
        PoolEventKind::Invalid,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolEventKind::Opened => "OPENED",
            PoolEventKind::Created => "CREATED",
            PoolEventKind::Acquiring => "ACQUIRING",
            PoolEventKind::Acquired => "ACQUIRED",
            PoolEventKind::Releasing => "RELEASING",
            PoolEventKind::Destroying => "DESTROYING",
            PoolEventKind::Closed => "CLOSED",
            PoolEventKind::IdleExpired => "IDLE_EXPIRED",
            PoolEventKind::LeaseExpired => "LEASE_EXPIRED",
            PoolEventKind::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for PoolEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of event kinds a listener wants to receive
///
/// # Examples
///
/// ```
/// use prunepool::{EventMask, PoolEventKind};
///
/// let mask = EventMask::of(&[PoolEventKind::Created, PoolEventKind::Destroying]);
/// assert!(mask.contains(PoolEventKind::Created));
/// assert!(!mask.contains(PoolEventKind::Acquired));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u16);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const ALL: EventMask = EventMask((1 << PoolEventKind::ALL.len()) - 1);

    pub fn of(kinds: &[PoolEventKind]) -> Self {
        EventMask(kinds.iter().fold(0, |bits, kind| bits | kind.bit()))
    }

    pub fn contains(&self, kind: PoolEventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn union(self, other: EventMask) -> Self {
        EventMask(self.0 | other.0)
    }
}

/// An action performed by a pool
#[derive(Debug, Clone)]
pub struct PoolEvent {
    pub kind: PoolEventKind,
    pub pool: Arc<str>,
    /// The resource the action applies to, `None` for pool-wide events
    /// and for a failed acquire.
    pub resource: Option<ResourceId>,
    pub timestamp: SystemTime,
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource {
            Some(id) => write!(f, "{}:{}:{}", self.pool, self.kind, id),
            None => write!(f, "{}:{}:none", self.pool, self.kind),
        }
    }
}

/// Receives events from a pool
pub trait PoolListener: Send + Sync {
    /// Kinds of events this listener wants, all by default
    fn interests(&self) -> EventMask {
        EventMask::ALL
    }

    fn on_event(&self, event: &PoolEvent);
}

/// Dispatches events to the listeners registered with a pool
pub struct PoolEvents {
    pool: Arc<str>,
    listeners: RwLock<Vec<Arc<dyn PoolListener>>>,
    wanted: AtomicU16,
}

impl PoolEvents {
    pub(crate) fn new(pool: Arc<str>) -> Self {
        Self {
            pool,
            listeners: RwLock::new(Vec::new()),
            wanted: AtomicU16::new(0),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn PoolListener>) {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
            self.update_wanted(&listeners);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn PoolListener>) {
        let mut listeners = self.listeners.write();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        self.update_wanted(&listeners);
    }

    pub fn clear_listeners(&self) {
        let mut listeners = self.listeners.write();
        listeners.clear();
        self.update_wanted(&listeners);
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.read().is_empty()
    }

    /// True when at least one listener wants this kind of event
    pub fn wants(&self, kind: PoolEventKind) -> bool {
        EventMask(self.wanted.load(Ordering::Relaxed)).contains(kind)
    }

    pub(crate) fn fire(&self, kind: PoolEventKind, resource: Option<ResourceId>) {
        if !self.wants(kind) {
            return;
        }
        let event = PoolEvent {
            kind,
            pool: Arc::clone(&self.pool),
            resource,
            timestamp: SystemTime::now(),
        };
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if !listener.interests().contains(kind) {
                continue;
            }
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)));
            if delivered.is_err() {
                error!(pool = %self.pool, event = %event, "Pool listener could not handle pool event");
            }
        }
    }

    fn update_wanted(&self, listeners: &[Arc<dyn PoolListener>]) {
        let mask = listeners
            .iter()
            .fold(EventMask::NONE, |mask, l| mask.union(l.interests()));
        self.wanted.store(mask.0, Ordering::Relaxed);
    }
}

impl fmt::Debug for PoolEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEvents")
            .field("pool", &self.pool)
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

/// Logs every event it receives at debug level
#[derive(Debug, Default)]
pub struct EventLogger {
    interests: Option<EventMask>,
}

impl EventLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only log the given kinds
    pub fn only(kinds: &[PoolEventKind]) -> Self {
        Self {
            interests: Some(EventMask::of(kinds)),
        }
    }
}

impl PoolListener for EventLogger {
    fn interests(&self) -> EventMask {
        self.interests.unwrap_or(EventMask::ALL)
    }

    fn on_event(&self, event: &PoolEvent) {
        debug!(pool = %event.pool, kind = %event.kind, resource = ?event.resource, "Pool event");
    }
}

/// Records received events, for diagnostics and tests
///
/// # Examples
///
/// ```
/// use prunepool::{EventRecorder, PoolEventKind, PoolListener};
///
/// let recorder = EventRecorder::new();
/// assert_eq!(recorder.count(PoolEventKind::Created), 0);
/// assert!(recorder.interests().contains(PoolEventKind::Invalid));
/// ```
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: SegQueue<PoolEvent>,
    /// Recorded events per kind, not affected by `take`
    counts: [AtomicUsize; PoolEventKind::ALL.len()],
    interests: Option<EventMask>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn only(kinds: &[PoolEventKind]) -> Self {
        Self {
            interests: Some(EventMask::of(kinds)),
            ..Self::default()
        }
    }

    /// Remove and return everything recorded so far
    pub fn take(&self) -> Vec<PoolEvent> {
        let mut events = Vec::with_capacity(self.events.len());
        while let Some(event) = self.events.pop() {
            events.push(event);
        }
        events
    }

    /// Number of events of the given kind recorded since creation or the last [`clear`](Self::clear)
    pub fn count(&self, kind: PoolEventKind) -> usize {
        self.counts[kind as usize].load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&self) {
        while self.events.pop().is_some() {}
        for count in &self.counts {
            count.store(0, Ordering::SeqCst);
        }
    }
}

impl PoolListener for EventRecorder {
    fn interests(&self) -> EventMask {
        self.interests.unwrap_or(EventMask::ALL)
    }

    fn on_event(&self, event: &PoolEvent) {
        self.counts[event.kind as usize].fetch_add(1, Ordering::SeqCst);
        self.events.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Panicking;

    impl PoolListener for Panicking {
        fn on_event(&self, _event: &PoolEvent) {
            panic!("listener failure");
        }
    }

    #[test]
    fn test_no_listeners_wants_nothing() {
        let events = PoolEvents::new(Arc::from("test"));
        assert!(!events.wants(PoolEventKind::Created));
    }

    #[test]
    fn test_interest_union() {
        let events = PoolEvents::new(Arc::from("test"));
        events.add_listener(Arc::new(EventRecorder::only(&[PoolEventKind::Created])));
        events.add_listener(Arc::new(EventRecorder::only(&[PoolEventKind::Invalid])));
        assert!(events.wants(PoolEventKind::Created));
        assert!(events.wants(PoolEventKind::Invalid));
        assert!(!events.wants(PoolEventKind::Acquired));
    }

    #[test]
    fn test_listener_filters_kinds() {
        let events = PoolEvents::new(Arc::from("test"));
        let created = Arc::new(EventRecorder::only(&[PoolEventKind::Created]));
        let all = Arc::new(EventRecorder::new());
        events.add_listener(created.clone());
        events.add_listener(all.clone());
        events.fire(PoolEventKind::Created, Some(ResourceId(1)));
        events.fire(PoolEventKind::Closed, None);
        assert_eq!(created.len(), 1);
        assert_eq!(all.len(), 2);
        assert_eq!(all.count(PoolEventKind::Closed), 1);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_dispatch() {
        let events = PoolEvents::new(Arc::from("test"));
        let recorder = Arc::new(EventRecorder::new());
        events.add_listener(Arc::new(Panicking));
        events.add_listener(recorder.clone());
        events.fire(PoolEventKind::Opened, None);
        assert_eq!(recorder.count(PoolEventKind::Opened), 1);
    }

    #[test]
    fn test_count_keeps_order_under_concurrent_recording() {
        let events = PoolEvents::new(Arc::from("test"));
        let recorder = Arc::new(EventRecorder::only(&[PoolEventKind::Created]));
        events.add_listener(recorder.clone());
        std::thread::scope(|s| {
            s.spawn(|| {
                for id in 0..1000 {
                    events.fire(PoolEventKind::Created, Some(ResourceId(id)));
                }
            });
            s.spawn(|| {
                for _ in 0..1000 {
                    assert!(recorder.count(PoolEventKind::Created) <= 1000);
                }
            });
        });
        assert_eq!(recorder.count(PoolEventKind::Created), 1000);
        let ids: Vec<u64> = recorder
            .take()
            .into_iter()
            .filter_map(|e| e.resource.map(|id| id.as_u64()))
            .collect();
        assert_eq!(ids, (0..1000).collect::<Vec<_>>());
        recorder.clear();
        assert_eq!(recorder.count(PoolEventKind::Created), 0);
    }

    #[test]
    fn test_remove_listener() {
        let events = PoolEvents::new(Arc::from("test"));
        let recorder: Arc<dyn PoolListener> = Arc::new(EventRecorder::new());
        events.add_listener(Arc::clone(&recorder));
        events.remove_listener(&recorder);
        assert!(!events.has_listeners());
        assert!(!events.wants(PoolEventKind::Opened));
    }

    #[test]
    fn test_display() {
        let event = PoolEvent {
            kind: PoolEventKind::Acquired,
            pool: Arc::from("db"),
            resource: None,
            timestamp: SystemTime::now(),
        };
        assert_eq!(event.to_string(), "db:ACQUIRED:none");
    }
}
