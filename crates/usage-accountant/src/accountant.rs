//! Usage accountant
//!
//! Facade over one [`Aggregator`] and one [`RateCappedEmitter`]. Callers
//! record observations; a flush loop drains closed buckets every flush
//! period and hands them to the emitter.

use crate::aggregator::Aggregator;
use crate::emitter::{EmitterConfig, OverflowPolicy, RateCappedEmitter};
use crate::metrics::AccountantMetrics;
use crate::producer::Producer;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use usage_common::{
    AccountantError, AppFeature, Granularity, Observation, ObservationError, PayloadEncoding,
    ResourceId, Result, UsageRecord, UsageUnit,
};

/// Accountant configuration
#[derive(Debug, Clone)]
pub struct AccountantConfig {
    /// Bus topic for usage records
    pub topic: String,
    /// Bucket width
    pub granularity: Granularity,
    /// Flush loop period; the granularity when unset
    pub flush_period: Option<Duration>,
    /// Maximum publish attempts per second
    pub max_emit_rate: f64,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub encoding: PayloadEncoding,
    pub retry: RetryPolicy,
    /// Resources accepted by `record`
    pub allowed_resources: BTreeSet<ResourceId>,
    /// Units accepted by `record`
    pub allowed_units: BTreeSet<UsageUnit>,
}

impl Default for AccountantConfig {
    fn default() -> Self {
        let emitter = EmitterConfig::default();
        Self {
            topic: emitter.topic,
            granularity: Granularity::default(),
            flush_period: None,
            max_emit_rate: emitter.max_rate,
            queue_capacity: emitter.queue_capacity,
            overflow_policy: emitter.overflow_policy,
            encoding: emitter.encoding,
            retry: emitter.retry,
            allowed_resources: ResourceId::ALL.into_iter().collect(),
            allowed_units: UsageUnit::ALL.into_iter().collect(),
        }
    }
}

impl AccountantConfig {
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_flush_period(mut self, period: Duration) -> Self {
        self.flush_period = Some(period);
        self
    }

    pub fn with_max_emit_rate(mut self, rate: f64) -> Self {
        self.max_emit_rate = rate;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn with_encoding(mut self, encoding: PayloadEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_allowed_resources(mut self, resources: impl IntoIterator<Item = ResourceId>) -> Self {
        self.allowed_resources = resources.into_iter().collect();
        self
    }

    pub fn with_allowed_units(mut self, units: impl IntoIterator<Item = UsageUnit>) -> Self {
        self.allowed_units = units.into_iter().collect();
        self
    }

    /// Effective flush period
    pub fn flush_period(&self) -> Duration {
        self.flush_period
            .unwrap_or_else(|| self.granularity.as_duration())
    }

    /// Emitter settings derived from this configuration
    pub fn emitter_config(&self) -> EmitterConfig {
        EmitterConfig {
            topic: self.topic.clone(),
            max_rate: self.max_emit_rate,
            queue_capacity: self.queue_capacity,
            overflow_policy: self.overflow_policy,
            encoding: self.encoding,
            retry: self.retry.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_period().is_zero() {
            return Err(AccountantError::Config("flush period must be positive".into()));
        }
        if self.allowed_resources.is_empty() {
            return Err(AccountantError::Config("allowed_resources must not be empty".into()));
        }
        if self.allowed_units.is_empty() {
            return Err(AccountantError::Config("allowed_units must not be empty".into()));
        }
        self.emitter_config().validate()
    }
}

/// Aggregates observations and emits them on a timer
pub struct UsageAccountant {
    config: AccountantConfig,
    aggregator: Aggregator,
    emitter: RateCappedEmitter,
    metrics: Arc<AccountantMetrics>,
    shutdown_tx: watch::Sender<bool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl UsageAccountant {
    /// Create an accountant publishing through `producer`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: AccountantConfig, producer: Arc<dyn Producer>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(
            AccountantMetrics::new().map_err(|e| AccountantError::Internal(e.to_string()))?,
        );
        let emitter = RateCappedEmitter::new(config.emitter_config(), producer, metrics.clone())?;
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            granularity = ?config.granularity.as_duration(),
            flush_period = ?config.flush_period(),
            "Usage accountant created"
        );

        Ok(Self {
            aggregator: Aggregator::new(config.granularity),
            config,
            emitter,
            metrics,
            shutdown_tx,
            flush_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &AccountantConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<AccountantMetrics> {
        &self.metrics
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Number of aggregates waiting for a flush
    pub fn pending(&self) -> usize {
        self.aggregator.len()
    }

    /// Number of records waiting for a publish token
    pub fn queued(&self) -> usize {
        self.emitter.queued()
    }

    /// Record one observation
    ///
    /// Rejects resources and units outside the configured allow-lists.
    pub fn record(&self, observation: &Observation) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AccountantError::Closed("accountant"));
        }

        let outcome = self
            .check_allowed(observation)
            .map_err(AccountantError::from)
            .and_then(|()| self.aggregator.record(observation));
        self.count(outcome)
    }

    /// Record an observation stamped with the system clock
    pub fn record_now(
        &self,
        resource: ResourceId,
        feature: &str,
        amount: Decimal,
        unit: UsageUnit,
    ) -> Result<()> {
        let observation = AppFeature::new(feature)
            .and_then(|feature| Observation::now(resource, feature, amount, unit));
        match observation {
            Ok(observation) => self.record(&observation),
            Err(e) => self.count(Err(e.into())),
        }
    }

    fn check_allowed(&self, observation: &Observation) -> std::result::Result<(), ObservationError> {
        if !self.config.allowed_resources.contains(&observation.resource) {
            return Err(ObservationError::UnknownResource(observation.resource.to_string()));
        }
        if !self.config.allowed_units.contains(&observation.unit) {
            return Err(ObservationError::UnknownUnit(observation.unit.to_string()));
        }
        Ok(())
    }

    fn count(&self, outcome: Result<()>) -> Result<()> {
        match &outcome {
            Ok(()) => self.metrics.observations_recorded.inc(),
            Err(_) => self.metrics.observations_rejected.inc(),
        }
        outcome
    }

    /// Emit every bucket that has closed by now
    pub async fn flush(&self) -> Result<usize> {
        self.flush_at(Utc::now()).await
    }

    /// Emit every bucket that closed at or before `now`
    #[instrument(skip(self))]
    pub async fn flush_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let records = self.aggregator.drain_closed(now);
        self.emit(records).await
    }

    /// Emit every aggregate, open buckets included
    #[instrument(skip(self))]
    pub async fn flush_all(&self) -> Result<usize> {
        let records = self.aggregator.drain();
        self.emit(records).await
    }

    async fn emit(&self, records: Vec<UsageRecord>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let count = records.len();
        self.metrics.records_flushed.inc_by(count as u64);
        debug!(count, "Flushing usage records");
        self.emitter.emit(records).await?;
        Ok(count)
    }

    /// Spawn the periodic flush loop
    ///
    /// The loop holds a weak reference and stops on shutdown or when the
    /// accountant is dropped.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.flush_task.lock();
        if slot.is_some() {
            warn!("Flush loop already running");
            return;
        }

        let period = self.config.flush_period();
        let accountant: Weak<Self> = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(accountant) = accountant.upgrade() else {
                            break;
                        };
                        match accountant.flush().await {
                            Ok(count) => debug!(count, "Periodic flush"),
                            Err(e) => warn!(error = %e, "Periodic flush failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Flush loop stopped");
        }));

        info!(period = ?period, "Flush loop started");
    }

    /// Stop the flush loop, emit everything still buffered, and drain the
    /// emitter, all within `grace`
    ///
    /// Returns the number of usage records abandoned at the deadline.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let deadline = Instant::now() + grace;
        info!("Shutting down usage accountant");

        self.shutdown_tx.send_replace(true);
        let task = self.flush_task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                warn!("Flush loop did not stop within the grace period");
            }
        }

        // Sealing under the aggregator's write lock orders every racing record
        // either into this snapshot or into a Closed error
        let records = self.aggregator.seal();
        self.metrics.records_flushed.inc_by(records.len() as u64);

        let mut not_enqueued = 0;
        let mut remaining = records.into_iter();
        while let Some(record) = remaining.next() {
            match tokio::time::timeout_at(deadline, self.emitter.emit(vec![record])).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    not_enqueued = 1 + remaining.len();
                    warn!(error = %e, "Final flush failed");
                    break;
                }
                Err(_) => {
                    not_enqueued = 1 + remaining.len();
                    break;
                }
            }
        }
        if not_enqueued > 0 {
            self.metrics.records_lost_on_shutdown.inc_by(not_enqueued as u64);
            warn!(lost = not_enqueued, "Grace period ran out during the final flush");
        }

        let lost = not_enqueued
            + self
                .emitter
                .shutdown(deadline.saturating_duration_since(Instant::now()))
                .await;
        info!(lost, "Usage accountant stopped");
        lost
    }
}
