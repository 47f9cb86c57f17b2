//! Prometheus metrics for the accountant pipeline
//!
//! Fetch and publish failures never propagate to callers; these counters
//! are where they become observable.

use prometheus::{IntCounter, IntGauge, Registry};

/// Counters for one accountant instance
pub struct AccountantMetrics {
    pub observations_recorded: IntCounter,
    pub observations_rejected: IntCounter,
    pub records_flushed: IntCounter,
    pub records_coalesced: IntCounter,
    pub records_published: IntCounter,
    pub publish_retries: IntCounter,
    pub publish_failures: IntCounter,
    pub overflow_events: IntCounter,
    pub records_lost_on_shutdown: IntCounter,
    pub queue_depth: IntGauge,
}

impl AccountantMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            observations_recorded: IntCounter::new(
                "usage_accountant_observations_recorded_total",
                "Observations folded into an aggregate",
            )?,
            observations_rejected: IntCounter::new(
                "usage_accountant_observations_rejected_total",
                "Observations rejected by validation or allow-lists",
            )?,
            records_flushed: IntCounter::new(
                "usage_accountant_records_flushed_total",
                "Usage records drained from the aggregator",
            )?,
            records_coalesced: IntCounter::new(
                "usage_accountant_records_coalesced_total",
                "Usage records merged into a queued record for the same key",
            )?,
            records_published: IntCounter::new(
                "usage_accountant_records_published_total",
                "Usage records accepted by the message bus",
            )?,
            publish_retries: IntCounter::new(
                "usage_accountant_publish_retries_total",
                "Publish attempts retried after a bus error",
            )?,
            publish_failures: IntCounter::new(
                "usage_accountant_publish_failures_total",
                "Usage records dropped after exhausting publish attempts",
            )?,
            overflow_events: IntCounter::new(
                "usage_accountant_overflow_events_total",
                "Usage records discarded because the emit queue was full",
            )?,
            records_lost_on_shutdown: IntCounter::new(
                "usage_accountant_records_lost_on_shutdown_total",
                "Queued usage records abandoned when the shutdown grace period ran out",
            )?,
            queue_depth: IntGauge::new(
                "usage_accountant_queue_depth",
                "Usage records waiting to be published",
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.observations_recorded.clone()))?;
        registry.register(Box::new(self.observations_rejected.clone()))?;
        registry.register(Box::new(self.records_flushed.clone()))?;
        registry.register(Box::new(self.records_coalesced.clone()))?;
        registry.register(Box::new(self.records_published.clone()))?;
        registry.register(Box::new(self.publish_retries.clone()))?;
        registry.register(Box::new(self.publish_failures.clone()))?;
        registry.register(Box::new(self.overflow_events.clone()))?;
        registry.register(Box::new(self.records_lost_on_shutdown.clone()))?;
        registry.register(Box::new(self.queue_depth.clone()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_once_per_registry() {
        let metrics = AccountantMetrics::new().unwrap();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());

        metrics.records_published.inc();
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "usage_accountant_records_published_total"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = AccountantMetrics::new().unwrap();
        let b = AccountantMetrics::new().unwrap();
        a.overflow_events.inc();
        assert_eq!(a.overflow_events.get(), 1);
        assert_eq!(b.overflow_events.get(), 0);
    }
}
