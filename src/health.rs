//! Health monitoring for resource pools

use crate::metrics::PoolMetrics;

/// Health status of a pool
///
/// # Examples
///
/// ```
/// use prunepool::{BoundedPool, FnFactory, PoolConfiguration};
///
/// let pool = BoundedPool::new(PoolConfiguration::new().with_min_size(2), FnFactory::new(|| Ok(()))).unwrap();
/// pool.open().unwrap();
///
/// let health = pool.health_status();
/// assert!(health.is_healthy());
/// assert_eq!(health.idle_resources, 2);
/// ```
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Leased resources relative to max. size (0.0 to 1.0)
    pub utilization: f64,

    pub idle_resources: usize,

    pub leased_resources: usize,

    /// Callers blocked in acquire
    pub waiting_callers: usize,

    pub max_size: usize,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    pub fn from_metrics(metrics: &PoolMetrics) -> Self {
        let utilization = metrics.utilization();
        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if utilization > 0.9 {
            warnings.push(format!("High utilization: {:.1}%", utilization * 100.0));
            is_healthy = false;
        }

        // Below min size means the factory failed to create resources
        if metrics.size < metrics.min_size {
            warnings.push(format!(
                "Pool has {} resources, minimum is {}",
                metrics.size, metrics.min_size
            ));
            is_healthy = false;
        }

        if metrics.waiting_callers > 0 {
            warnings.push(format!("{} callers waiting for a resource", metrics.waiting_callers));
        }

        Self {
            is_healthy,
            warning_count: warnings.len(),
            utilization,
            idle_resources: metrics.idle_resources,
            leased_resources: metrics.leased_resources,
            waiting_callers: metrics.waiting_callers,
            max_size: metrics.max_size,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}
