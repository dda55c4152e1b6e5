//! Pool and registry configuration options

use crate::errors::{PoolError, PoolResult};
use crate::scheduler::PruneScheduler;
use std::time::Duration;
use tracing::warn;

/// 1 second
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_millis(1_000);
/// 1 minute
pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_millis(60_000);
/// 2 minutes
pub const DEFAULT_MAX_LEASE_TIME: Duration = Duration::from_millis(120_000);
/// 30 minutes
pub const DEFAULT_MAX_LIFE_TIME: Duration = Duration::from_millis(1_800_000);
/// Used by `acquire()` calls that do not pass a timeout.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
/// Half a minute
pub const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_millis(30_000);

/// Log level used when a lease expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseTraceLevel {
    #[default]
    Debug,
    Info,
    Warn,
    Error,
}

/// Configuration for pool behavior
///
/// # Examples
///
/// ```
/// use prunepool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_name("db")
///     .with_min_size(2)
///     .with_max_size(10)
///     .with_max_idle_time(Duration::from_secs(30));
///
/// assert_eq!(config.max_size, 10);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfiguration {
    /// Name used in log messages, events and errors
    pub name: Option<String>,

    /// Number of resources the pool tries to keep at all times
    pub min_size: usize,

    /// Maximum number of resources (idle plus leased)
    pub max_size: usize,

    /// Serve the longest waiting caller first
    pub fair: bool,

    /// Create resources one at a time
    pub sync_creation: bool,

    /// Timeout used by `acquire()` without arguments
    pub acquire_timeout: Duration,

    /// Interval between prune passes, `None` disables scheduled pruning
    pub prune_interval: Option<Duration>,

    /// Idle resources above `min_size` are removed after this time
    pub max_idle_time: Option<Duration>,

    /// Leases are expired after this time
    pub max_lease_time: Option<Duration>,

    /// Resources are removed after this age, regardless of state
    pub max_life_time: Option<Duration>,

    /// Cancel the lease token of a leaser that held a resource for too long
    pub interrupt_leaser: bool,

    /// Request destruction of a resource when its lease expires
    pub destroy_on_expired_lease: bool,

    /// Log level for expired lease diagnostics
    pub lease_trace: LeaseTraceLevel,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            name: None,
            min_size: 0,
            max_size: 4,
            fair: false,
            sync_creation: false,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            prune_interval: Some(DEFAULT_PRUNE_INTERVAL),
            max_idle_time: Some(DEFAULT_MAX_IDLE_TIME),
            max_lease_time: Some(DEFAULT_MAX_LEASE_TIME),
            max_life_time: Some(DEFAULT_MAX_LIFE_TIME),
            interrupt_leaser: false,
            destroy_on_expired_lease: false,
            lease_trace: LeaseTraceLevel::Debug,
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    pub fn with_fair(mut self, fair: bool) -> Self {
        self.fair = fair;
        self
    }

    pub fn with_sync_creation(mut self, sync: bool) -> Self {
        self.sync_creation = sync;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = Some(interval);
        self
    }

    /// Never schedule prune passes for this pool
    pub fn without_pruning(mut self) -> Self {
        self.prune_interval = None;
        self
    }

    pub fn with_max_idle_time(mut self, time: Duration) -> Self {
        self.max_idle_time = Some(time);
        self
    }

    pub fn with_max_lease_time(mut self, time: Duration) -> Self {
        self.max_lease_time = Some(time);
        self
    }

    pub fn with_max_life_time(mut self, time: Duration) -> Self {
        self.max_life_time = Some(time);
        self
    }

    /// Disable idle, lease and life expiry
    pub fn without_expiry(mut self) -> Self {
        self.max_idle_time = None;
        self.max_lease_time = None;
        self.max_life_time = None;
        self
    }

    /// Cancel the leaser's token when a lease expires.
    /// Also raises expired lease logging to error level.
    pub fn with_interrupt_leaser(mut self, interrupt: bool) -> Self {
        self.interrupt_leaser = interrupt;
        if interrupt {
            self.lease_trace = LeaseTraceLevel::Error;
        }
        self
    }

    pub fn with_destroy_on_expired_lease(mut self, destroy: bool) -> Self {
        self.destroy_on_expired_lease = destroy;
        self
    }

    pub fn with_lease_trace(mut self, level: LeaseTraceLevel) -> Self {
        self.lease_trace = level;
        self
    }

    /// Check the size bounds and timings
    ///
    /// # Examples
    ///
    /// ```
    /// use prunepool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new().with_min_size(5).with_max_size(2);
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfiguration(
                "max_size must be at least 1".to_string(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfiguration(format!(
                "min_size ({}) must not exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.prune_interval.is_some_and(|i| i.is_zero()) {
            return Err(PoolError::InvalidConfiguration(
                "prune_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate and make sure the life time outlasts idle and lease times.
    pub(crate) fn normalized(mut self, pool: &str) -> PoolResult<Self> {
        self.validate()?;
        if let Some(life) = self.max_life_time {
            if let Some(idle) = self.max_idle_time.filter(|idle| *idle > life) {
                warn!(
                    pool = %pool,
                    ?life,
                    ?idle,
                    "Max. life time must be greater than max. idle time, using two times max. idle time"
                );
                self.max_life_time = Some(idle.saturating_mul(2));
            }
        }
        if let (Some(life), Some(lease)) = (self.max_life_time, self.max_lease_time) {
            if lease > life {
                warn!(
                    pool = %pool,
                    ?life,
                    ?lease,
                    "Max. life time must be greater than max. lease time, using two times max. lease time"
                );
                self.max_life_time = Some(lease.saturating_mul(2));
            }
        }
        Ok(self)
    }
}

/// Configuration for a [`PoolRegistry`](crate::PoolRegistry)
#[derive(Debug, Clone)]
pub struct RegistryConfiguration {
    /// Name used in log messages and errors
    pub name: Option<String>,

    /// Interval at which empty and unused sub-pools are removed
    pub clean_interval: Duration,

    /// Scheduler handed to the registry factory for pruning sub-pools
    pub scheduler: Option<PruneScheduler>,

    /// Scheduler running the registry's own clean task
    pub cleaner: Option<PruneScheduler>,
}

impl Default for RegistryConfiguration {
    fn default() -> Self {
        Self {
            name: None,
            clean_interval: DEFAULT_CLEAN_INTERVAL,
            scheduler: None,
            cleaner: None,
        }
    }
}

impl RegistryConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Values of zero are ignored
    pub fn with_clean_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.clean_interval = interval;
        }
        self
    }

    pub fn with_scheduler(mut self, scheduler: PruneScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_cleaner(mut self, cleaner: PruneScheduler) -> Self {
        self.cleaner = Some(cleaner);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfiguration::default();
        assert_eq!(config.min_size, 0);
        assert_eq!(config.max_size, 4);
        assert_eq!(config.prune_interval, Some(Duration::from_millis(1000)));
        assert_eq!(config.max_idle_time, Some(Duration::from_millis(60_000)));
        assert_eq!(config.max_lease_time, Some(Duration::from_millis(120_000)));
        assert!(!config.interrupt_leaser);
        assert!(!config.destroy_on_expired_lease);
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(PoolConfiguration::new().with_max_size(0).validate().is_err());
        assert!(
            PoolConfiguration::new()
                .with_min_size(3)
                .with_max_size(2)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_life_time_corrected() {
        let config = PoolConfiguration::new()
            .with_max_idle_time(Duration::from_millis(100))
            .with_max_lease_time(Duration::from_millis(500))
            .with_max_life_time(Duration::from_millis(50))
            .normalized("test")
            .unwrap();
        assert_eq!(config.max_life_time, Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_life_time_correction_saturates() {
        let config = PoolConfiguration::new()
            .with_max_idle_time(Duration::MAX)
            .with_max_life_time(Duration::from_secs(1))
            .normalized("test")
            .unwrap();
        assert_eq!(config.max_life_time, Some(Duration::MAX));
    }

    #[test]
    fn test_interrupt_raises_trace_level() {
        let config = PoolConfiguration::new().with_interrupt_leaser(true);
        assert_eq!(config.lease_trace, LeaseTraceLevel::Error);
    }

    #[test]
    fn test_zero_clean_interval_ignored() {
        let config = RegistryConfiguration::new().with_clean_interval(Duration::ZERO);
        assert_eq!(config.clean_interval, DEFAULT_CLEAN_INTERVAL);
    }
}
