//! Metrics collection and export for resource pools

use std::collections::HashMap;
use std::fmt::Write;

#[cfg(feature = "metrics")]
use serde::Serialize;

/// Snapshot of the counters and sizes of a pool
///
/// # Examples
///
/// ```
/// use prunepool::{BoundedPool, FnFactory, PoolConfiguration};
/// use std::time::Duration;
///
/// let pool = BoundedPool::new(PoolConfiguration::new().with_max_size(4), FnFactory::new(|| Ok(1u8))).unwrap();
/// pool.open().unwrap();
///
/// let lease = pool.acquire_timeout(Duration::ZERO).unwrap();
/// let metrics = pool.metrics();
/// assert_eq!(metrics.created, 1);
/// assert_eq!(metrics.leased_resources, 1);
/// assert_eq!(metrics.utilization(), 0.25);
/// pool.release(lease);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "metrics", derive(Serialize))]
pub struct PoolMetrics {
    /// Total resources created
    pub created: u64,

    /// Total resources handed to the factory for destruction
    pub destroyed: u64,

    /// Resources removed because they were idle too long
    pub idle_expired: u64,

    /// Leases that expired
    pub lease_expired: u64,

    /// Resources removed because they reached their max. life time
    pub life_ended: u64,

    /// Resources the factory reported invalid on acquire
    pub invalid: u64,

    /// Idle plus leased resources
    pub size: usize,

    pub idle_resources: usize,

    pub leased_resources: usize,

    /// Callers blocked in acquire
    pub waiting_callers: usize,

    /// Highest number of leased resources seen
    pub peak_leased: usize,

    /// Highest number of blocked callers seen
    pub peak_waiting: usize,

    pub min_size: usize,

    pub max_size: usize,
}

impl PoolMetrics {
    /// Leased resources relative to the maximum size (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.max_size > 0 {
            self.leased_resources as f64 / self.max_size as f64
        } else {
            0.0
        }
    }

    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("created".to_string(), self.created.to_string());
        metrics.insert("destroyed".to_string(), self.destroyed.to_string());
        metrics.insert("idle_expired".to_string(), self.idle_expired.to_string());
        metrics.insert("lease_expired".to_string(), self.lease_expired.to_string());
        metrics.insert("life_ended".to_string(), self.life_ended.to_string());
        metrics.insert("invalid".to_string(), self.invalid.to_string());
        metrics.insert("size".to_string(), self.size.to_string());
        metrics.insert("idle_resources".to_string(), self.idle_resources.to_string());
        metrics.insert("leased_resources".to_string(), self.leased_resources.to_string());
        metrics.insert("waiting_callers".to_string(), self.waiting_callers.to_string());
        metrics.insert("peak_leased".to_string(), self.peak_leased.to_string());
        metrics.insert("peak_waiting".to_string(), self.peak_waiting.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization()));
        metrics.insert("max_size".to_string(), self.max_size.to_string());
        metrics
    }
}

/// Metrics exporter for Prometheus
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use prunepool::{MetricsExporter, PoolMetrics};
    /// use std::collections::HashMap;
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&PoolMetrics::default(), "db", Some(&tags));
    /// assert!(output.contains("pool_resources_leased"));
    /// assert!(output.contains("service=\"api\""));
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        // Gauge metrics
        Self::sample(&mut output, &labels, "pool_resources", "gauge", "Idle plus leased resources", metrics.size);
        Self::sample(&mut output, &labels, "pool_resources_idle", "gauge", "Idle resources", metrics.idle_resources);
        Self::sample(&mut output, &labels, "pool_resources_leased", "gauge", "Leased resources", metrics.leased_resources);
        Self::sample(&mut output, &labels, "pool_callers_waiting", "gauge", "Callers waiting for a resource", metrics.waiting_callers);
        Self::sample(&mut output, &labels, "pool_utilization", "gauge", "Leased resources relative to max. size", format!("{:.2}", metrics.utilization()));

        // Counter metrics
        Self::sample(&mut output, &labels, "pool_resources_created_total", "counter", "Resources created", metrics.created);
        Self::sample(&mut output, &labels, "pool_resources_destroyed_total", "counter", "Resources destroyed", metrics.destroyed);
        Self::sample(&mut output, &labels, "pool_idle_expired_total", "counter", "Resources idle for too long", metrics.idle_expired);
        Self::sample(&mut output, &labels, "pool_lease_expired_total", "counter", "Expired leases", metrics.lease_expired);
        Self::sample(&mut output, &labels, "pool_life_ended_total", "counter", "Resources past their max. life time", metrics.life_ended);
        Self::sample(&mut output, &labels, "pool_invalid_total", "counter", "Resources found invalid", metrics.invalid);

        output
    }

    fn sample(
        output: &mut String,
        labels: &str,
        name: &str,
        kind: &str,
        help: &str,
        value: impl std::fmt::Display,
    ) {
        // Writing to a String cannot fail
        let _ = writeln!(output, "# HELP {name} {help}");
        let _ = writeln!(output, "# TYPE {name} {kind}");
        let _ = writeln!(output, "{name}{{{labels}}} {value}");
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut tags: Vec<_> = tags.iter().collect();
            tags.sort();
            for (key, value) in tags {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }

    /// Register the metrics as gauges in a Prometheus registry
    #[cfg(feature = "metrics")]
    pub fn register(
        metrics: &PoolMetrics,
        pool_name: &str,
        registry: &prometheus::Registry,
    ) -> prometheus::Result<()> {
        use prometheus::{IntGauge, Opts};

        let values: [(&str, &str, i64); 10] = [
            ("pool_resources", "Idle plus leased resources", metrics.size as i64),
            ("pool_resources_idle", "Idle resources", metrics.idle_resources as i64),
            ("pool_resources_leased", "Leased resources", metrics.leased_resources as i64),
            ("pool_callers_waiting", "Callers waiting for a resource", metrics.waiting_callers as i64),
            ("pool_resources_created", "Resources created", metrics.created as i64),
            ("pool_resources_destroyed", "Resources destroyed", metrics.destroyed as i64),
            ("pool_idle_expired", "Resources idle for too long", metrics.idle_expired as i64),
            ("pool_lease_expired", "Expired leases", metrics.lease_expired as i64),
            ("pool_life_ended", "Resources past their max. life time", metrics.life_ended as i64),
            ("pool_invalid", "Resources found invalid", metrics.invalid as i64),
        ];
        for (name, help, value) in values {
            let gauge = IntGauge::with_opts(Opts::new(name, help).const_label("pool", pool_name))?;
            gauge.set(value);
            registry.register(Box::new(gauge))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PoolMetrics {
        PoolMetrics {
            created: 5,
            destroyed: 2,
            lease_expired: 1,
            size: 3,
            idle_resources: 1,
            leased_resources: 2,
            max_size: 4,
            ..PoolMetrics::default()
        }
    }

    #[test]
    fn test_utilization() {
        assert_eq!(sample().utilization(), 0.5);
        assert_eq!(PoolMetrics::default().utilization(), 0.0);
    }

    #[test]
    fn test_export_map() {
        let map = sample().export();
        assert_eq!(map["created"], "5");
        assert_eq!(map["lease_expired"], "1");
        assert_eq!(map["utilization"], "0.50");
    }

    #[test]
    fn test_prometheus_text() {
        let output = MetricsExporter::export_prometheus(&sample(), "db", None);
        assert!(output.contains("# TYPE pool_resources_created_total counter"));
        assert!(output.contains("pool_resources_created_total{pool=\"db\"} 5"));
        assert!(output.contains("pool_utilization{pool=\"db\"} 0.50"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_prometheus_registry() {
        let registry = prometheus::Registry::new();
        MetricsExporter::register(&sample(), "db", &registry).unwrap();
        let families = registry.gather();
        let created = families
            .iter()
            .find(|f| f.get_name() == "pool_resources_created")
            .unwrap();
        assert_eq!(created.get_metric()[0].get_gauge().get_value(), 5.0);
    }
}
