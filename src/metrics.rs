use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

use crate::window::Admission;

/// Metrics collector for the rate limiter
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    checks: CounterVec,
    usage_records: Counter,
    config_cache: CounterVec,
    admin_actions: CounterVec,
    check_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let checks = CounterVec::new(
            Opts::new(
                "ratelimit_checks_total",
                "Rate limit checks by outcome (allowed, burst, rejected, timeout)",
            ),
            &["outcome"],
        )?;

        let usage_records = Counter::new(
            "ratelimit_usage_records_total",
            "Usage records written for admitted requests",
        )?;

        let config_cache = CounterVec::new(
            Opts::new(
                "ratelimit_config_cache_total",
                "Tenant limit lookups served from cache (hit) or the store (miss)",
            ),
            &["result"],
        )?;

        let admin_actions = CounterVec::new(
            Opts::new(
                "ratelimit_admin_actions_total",
                "Administrative operations by action",
            ),
            &["action"],
        )?;

        let check_duration = Histogram::with_opts(HistogramOpts::new(
            "ratelimit_check_duration_seconds",
            "Duration of rate limit checks in seconds",
        ))?;

        registry.register(Box::new(checks.clone()))?;
        registry.register(Box::new(usage_records.clone()))?;
        registry.register(Box::new(config_cache.clone()))?;
        registry.register(Box::new(admin_actions.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;

        Ok(Self {
            registry,
            checks,
            usage_records,
            config_cache,
            admin_actions,
            check_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_admission(&self, admission: Admission) {
        self.checks.with_label_values(&[admission.as_str()]).inc();
    }

    pub fn record_timeout(&self) {
        self.checks.with_label_values(&["timeout"]).inc();
    }

    pub fn record_usage_record(&self) {
        self.usage_records.inc();
    }

    pub fn record_config_cache(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.config_cache.with_label_values(&[result]).inc();
    }

    pub fn record_admin_action(&self, action: &str) {
        self.admin_actions.with_label_values(&[action]).inc();
    }

    /// Create a timer for measuring check duration
    pub fn start_check_timer(&self) -> prometheus::HistogramTimer {
        self.check_duration.start_timer()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_gathering() {
        let metrics = Metrics::new().unwrap();

        metrics.record_admission(Admission::Within);
        metrics.record_admission(Admission::Burst);
        metrics.record_admission(Admission::Rejected);
        metrics.record_timeout();
        metrics.record_usage_record();
        metrics.record_config_cache(false);
        metrics.record_admin_action("block");
        drop(metrics.start_check_timer());

        let families = metrics.registry().gather();
        let checks = families
            .iter()
            .find(|f| f.get_name() == "ratelimit_checks_total")
            .expect("checks metric registered");
        assert_eq!(checks.get_metric().len(), 4);

        assert!(families
            .iter()
            .any(|f| f.get_name() == "ratelimit_usage_records_total"));
    }
}
