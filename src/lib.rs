//! # prunepool
//!
//! Thread-safe resource pools that keep themselves in shape: bounded in
//! size, pruned of idle, over-leased and old resources, and restored to
//! their minimum size after resources went bad.
//!
//! ## Features
//!
//! - [`BasicPool`]: unbounded LIFO re-use of resources
//! - [`BoundedPool`]: min and max size, blocking acquire with timeout, fair mode
//! - [`PrunedPool`]: idle, lease and life time expiry plus validation on acquire
//! - [`PruneScheduler`]: one background thread pruning many pools
//! - [`PoolRegistry`]: a pool per key, created on demand and removed when unused
//! - Lifecycle events with filtered listeners
//! - Metrics, Prometheus export and health status
//!
//! ## Quick Start
//!
//! ```rust
//! use prunepool::{FnFactory, PoolConfiguration, PrunedPool};
//! use std::time::Duration;
//!
//! let config = PoolConfiguration::new()
//!     .with_min_size(1)
//!     .with_max_size(4)
//!     .with_max_idle_time(Duration::from_secs(60));
//! let pool = PrunedPool::new(config, FnFactory::new(|| Ok(Vec::<u8>::with_capacity(1024)))).unwrap();
//! pool.open().unwrap();
//!
//! let mut buffer = pool.acquire().unwrap();
//! buffer.extend_from_slice(b"hello");
//! buffer.clear();
//! pool.release(buffer);
//! pool.close();
//! ```

mod basic;
mod bounded;
mod cancel;
mod config;
mod errors;
mod events;
mod factory;
mod health;
mod idle;
mod lease;
mod metrics;
mod pruned;
mod registry;
mod scheduler;

pub use basic::BasicPool;
pub use bounded::BoundedPool;
pub use cancel::CancelToken;
pub use config::{
    DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_CLEAN_INTERVAL, DEFAULT_MAX_IDLE_TIME, DEFAULT_MAX_LEASE_TIME,
    DEFAULT_MAX_LIFE_TIME, DEFAULT_PRUNE_INTERVAL, LeaseTraceLevel, PoolConfiguration,
    RegistryConfiguration,
};
pub use errors::{FactoryError, PoolError, PoolResult};
pub use events::{
    EventLogger, EventMask, EventRecorder, PoolEvent, PoolEventKind, PoolEvents, PoolListener,
};
pub use factory::{FnFactory, ResourceFactory};
pub use health::HealthStatus;
pub use lease::{Pooled, ResourceId};
pub use metrics::{MetricsExporter, PoolMetrics};
pub use pruned::PrunedPool;
pub use registry::{KeyedPoolFactory, PoolRegistry, RegistryFactory};
pub use scheduler::{PruneScheduler, PruneTarget, TaskId};
