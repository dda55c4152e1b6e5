//! Lease handles and per-resource bookkeeping

use crate::cancel::CancelToken;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Weak;
use std::time::{Duration, Instant};

/// Identifies a resource within its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u64);

impl ResourceId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A freshly created resource, not yet idle or leased.
#[derive(Debug)]
pub(crate) struct Slot<T> {
    pub id: ResourceId,
    pub value: T,
    pub created_at: Instant,
}

/// An idle resource waiting in the queue.
#[derive(Debug)]
pub(crate) struct IdleEntry<T> {
    pub id: ResourceId,
    pub value: T,
    pub created_at: Instant,
    pub idle_since: Instant,
}

impl<T> IdleEntry<T> {
    pub fn from_slot(slot: Slot<T>) -> Self {
        Self {
            id: slot.id,
            value: slot.value,
            created_at: slot.created_at,
            idle_since: Instant::now(),
        }
    }

    pub fn into_slot(self) -> Slot<T> {
        Slot {
            id: self.id,
            value: self.value,
            created_at: self.created_at,
        }
    }
}

/// What the pool remembers about a leased resource.
#[derive(Debug, Clone)]
pub(crate) struct LeaseRecord {
    pub created_at: Instant,
    pub acquired_at: Instant,
    pub lease_end: Option<Instant>,
    pub token: CancelToken,
    pub leaser: String,
}

impl LeaseRecord {
    pub fn new(created_at: Instant, token: CancelToken) -> Self {
        Self {
            created_at,
            acquired_at: Instant::now(),
            lease_end: None,
            token,
            leaser: current_leaser(),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.lease_end.is_some_and(|end| now > end)
    }
}

fn current_leaser() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => format!("{name} ({:?})", thread.id()),
        None => format!("{:?}", thread.id()),
    }
}

/// Where a lease goes back to when it ends.
pub(crate) trait Reclaim<T>: Send + Sync {
    /// Take back the resource of a lease. Returns true when it became idle.
    fn reclaim(&self, slot: Slot<T>) -> bool;

    /// Stop counting a lease whose resource left the pool.
    fn forget(&self, id: ResourceId);
}

/// A resource leased from a pool.
///
/// Hand it back with the pool's `release` method. A lease that is dropped
/// goes back to its pool the same way. When the pool no longer exists the
/// resource is simply dropped.
pub struct Pooled<T> {
    value: Option<T>,
    id: ResourceId,
    created_at: Instant,
    token: CancelToken,
    home: Weak<dyn Reclaim<T>>,
}

impl<T> Pooled<T> {
    pub(crate) fn new(slot: Slot<T>, token: CancelToken, home: Weak<dyn Reclaim<T>>) -> Self {
        Self {
            value: Some(slot.value),
            id: slot.id,
            created_at: slot.created_at,
            token,
            home,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Time since the resource was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Token the pool cancels when it gives up on this lease
    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Take the resource out of the pool for good.
    ///
    /// The pool stops counting the lease, so its slot is free for a new resource.
    /// Destroying the resource is up to the caller.
    pub fn into_inner(self) -> T {
        self.detach().value
    }

    /// Leave the pool the lease came from and keep the resource.
    pub(crate) fn detach(self) -> Slot<T> {
        if let Some(home) = self.home.upgrade() {
            home.forget(self.id);
        }
        self.into_slot()
    }

    pub(crate) fn into_slot(mut self) -> Slot<T> {
        Slot {
            id: self.id,
            value: self.value.take().expect("lease holds its resource until consumed"),
            created_at: self.created_at,
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        let slot = Slot {
            id: self.id,
            value,
            created_at: self.created_at,
        };
        if let Some(home) = self.home.upgrade() {
            home.reclaim(slot);
        }
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.value.as_ref().expect("lease holds its resource until consumed")
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value.as_mut().expect("lease holds its resource until consumed")
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("id", &self.id)
            .field("value", &self.value)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
