//! Error types for the resource pools

use std::time::Duration;
use thiserror::Error;

/// Error returned by a [`ResourceFactory`](crate::ResourceFactory) that failed to create
/// or destroy a resource.
pub type FactoryError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool {pool} is closed")]
    Closed { pool: String },

    #[error("Pool {pool} is not opened")]
    NotOpened { pool: String },

    #[error("Could not acquire resource from pool {pool} within {timeout:?}")]
    AcquireTimeout { pool: String, timeout: Duration },

    #[error("Pool {pool} factory failed to create a resource: {source}")]
    Creation {
        pool: String,
        #[source]
        source: FactoryError,
    },

    #[error("Waiting for a resource from pool {pool} was interrupted")]
    Interrupted { pool: String },

    #[error("Invalid pool configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Pool registry {registry} is closed")]
    RegistryClosed { registry: String },

    #[error("Prune scheduler {scheduler} could not start: {source}")]
    SchedulerStart {
        scheduler: String,
        #[source]
        source: std::io::Error,
    },
}

impl PoolError {
    /// True for errors caused by the pool or registry being closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, PoolError::Closed { .. } | PoolError::RegistryClosed { .. })
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
