//! Cooperative cancellation for blocked acquires and expired leases

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cancellation flag shared between a caller and the pool.
///
/// Passed to `acquire_interruptible`, the token aborts a blocked wait once cancelled
/// and becomes the token of the resulting lease. When the pool expires that lease
/// and is configured to interrupt leasers, it cancels the same token.
///
/// # Examples
///
/// ```
/// use prunepool::CancelToken;
///
/// let token = CancelToken::new();
/// let observer = token.clone();
/// token.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
