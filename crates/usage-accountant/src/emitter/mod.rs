//! Rate-capped emitter
//!
//! Publishes usage records to the message bus without exceeding a maximum
//! publish rate:
//! - `emit` enqueues into a bounded [`EmitQueue`] and normally returns at once
//! - a background publish loop pops records, waits on a [`TokenBucket`], and
//!   publishes with bounded exponential backoff
//! - records that exhaust their attempts are dropped and counted
//!
//! Every publish attempt, retries included, consumes one token.

pub mod queue;
pub mod token_bucket;

pub use queue::{Admission, EmitQueue};
pub use token_bucket::TokenBucket;

use crate::metrics::AccountantMetrics;
use crate::producer::Producer;
use crate::retry::RetryPolicy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use usage_common::{AccountantError, PayloadEncoding, PublishError, Result, UsageRecord};

/// What to do when records arrive faster than they can be published
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Suspend the caller until the queue has room
    Block,
    /// Discard the oldest queued record to admit the newest
    DropOldest,
    /// Merge records for the same key while they wait
    #[default]
    Coalesce,
}

/// Emitter configuration
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Bus topic
    pub topic: String,
    /// Maximum publish attempts per second
    pub max_rate: f64,
    /// Queue capacity in records
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub encoding: PayloadEncoding,
    pub retry: RetryPolicy,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            topic: usage_common::DEFAULT_TOPIC.to_string(),
            max_rate: 50.0,
            queue_capacity: 10_000,
            overflow_policy: OverflowPolicy::default(),
            encoding: PayloadEncoding::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EmitterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(AccountantError::Config("topic must not be empty".into()));
        }
        if !self.max_rate.is_finite() || self.max_rate <= 0.0 {
            return Err(AccountantError::Config(format!(
                "max emit rate must be positive, got {}",
                self.max_rate
            )));
        }
        if self.queue_capacity == 0 {
            return Err(AccountantError::Config("queue capacity must be positive".into()));
        }
        Ok(())
    }
}

/// State shared between `emit` callers and the publish loop
struct Shared {
    queue: Mutex<EmitQueue>,
    /// Record popped by the publish loop and not yet published or dropped
    in_flight: Mutex<Option<UsageRecord>>,
    /// Signalled when a record is queued or the emitter closes
    items: Notify,
    /// Signalled when a record leaves the queue
    space: Notify,
    closed: AtomicBool,
    metrics: Arc<AccountantMetrics>,
}

/// Token-bucket limited publisher
pub struct RateCappedEmitter {
    config: EmitterConfig,
    shared: Arc<Shared>,
    publisher: Mutex<Option<JoinHandle<()>>>,
}

impl RateCappedEmitter {
    /// Create an emitter and spawn its publish loop
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: EmitterConfig,
        producer: Arc<dyn Producer>,
        metrics: Arc<AccountantMetrics>,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            queue: Mutex::new(EmitQueue::new(config.overflow_policy, config.queue_capacity)),
            in_flight: Mutex::new(None),
            items: Notify::new(),
            space: Notify::new(),
            closed: AtomicBool::new(false),
            metrics,
        });

        let publisher = tokio::spawn(Self::publish_loop(
            config.clone(),
            shared.clone(),
            producer,
        ));

        info!(
            topic = %config.topic,
            max_rate = config.max_rate,
            policy = ?config.overflow_policy,
            "Emitter started"
        );

        Ok(Self {
            config,
            shared,
            publisher: Mutex::new(Some(publisher)),
        })
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.config
    }

    /// Records waiting to be published
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Enqueue records for publishing
    ///
    /// Returns once every record is queued, merged, or has displaced an
    /// older one. Suspends only when the queue is full and the policy
    /// does not allow discarding.
    pub async fn emit(&self, records: Vec<UsageRecord>) -> Result<()> {
        for record in records {
            self.offer(record).await?;
        }
        Ok(())
    }

    async fn offer(&self, mut record: UsageRecord) -> Result<()> {
        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(AccountantError::Closed("emitter"));
            }

            let space = self.shared.space.notified();
            let admission = self.shared.queue.lock().push(record);

            match admission {
                Admission::Queued => {
                    self.shared.metrics.queue_depth.inc();
                    self.shared.items.notify_one();
                    return Ok(());
                }
                Admission::Coalesced => {
                    self.shared.metrics.records_coalesced.inc();
                    return Ok(());
                }
                Admission::DroppedOldest(dropped) => {
                    self.shared.metrics.overflow_events.inc();
                    warn!(
                        resource = %dropped.resource,
                        feature = %dropped.feature,
                        bucket_start = %dropped.bucket_start,
                        amount = %dropped.total_amount,
                        "Emit queue full, dropped oldest usage record"
                    );
                    self.shared.items.notify_one();
                    return Ok(());
                }
                Admission::Full(rejected) => {
                    debug!("Emit queue full, waiting for space");
                    record = rejected;
                    space.await;
                }
            }
        }
    }

    /// Stop accepting records and publish what is queued within `grace`
    ///
    /// Returns the number of queued records abandoned when the grace period
    /// runs out.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.close();

        let handle = self.publisher.lock().take();
        let Some(mut handle) = handle else {
            return 0;
        };

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => {
                info!("Emitter drained");
                0
            }
            Err(_) => {
                handle.abort();
                // Wait for the cancellation so the in-flight slot is settled
                let _ = handle.await;
                let lost = {
                    let mut queue = self.shared.queue.lock();
                    let mut lost = queue.len();
                    while queue.pop().is_some() {}
                    if self.shared.in_flight.lock().take().is_some() {
                        lost += 1;
                    }
                    lost
                };
                self.shared.metrics.records_lost_on_shutdown.inc_by(lost as u64);
                self.shared.metrics.queue_depth.set(0);
                warn!(lost, "Shutdown grace period elapsed, abandoning queued usage records");
                lost
            }
        }
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.items.notify_one();
        self.shared.space.notify_waiters();
    }

    /// Background publish loop
    async fn publish_loop(config: EmitterConfig, shared: Arc<Shared>, producer: Arc<dyn Producer>) {
        let mut bucket = TokenBucket::new(config.max_rate);

        loop {
            let items = shared.items.notified();
            let next = shared.queue.lock().pop();

            match next {
                Some(record) => {
                    shared.metrics.queue_depth.dec();
                    *shared.in_flight.lock() = Some(record.clone());
                    shared.space.notify_waiters();
                    Self::publish_record(
                        &config,
                        &shared.metrics,
                        producer.as_ref(),
                        &mut bucket,
                        &record,
                    )
                    .await;
                    shared.in_flight.lock().take();
                }
                None => {
                    if shared.closed.load(Ordering::Acquire) {
                        break;
                    }
                    items.await;
                }
            }
        }

        if let Err(e) = producer.flush().await {
            warn!(error = %e, "Producer flush failed");
        }
        debug!("Publish loop exiting");
    }

    async fn publish_record(
        config: &EmitterConfig,
        metrics: &AccountantMetrics,
        producer: &dyn Producer,
        bucket: &mut TokenBucket,
        record: &UsageRecord,
    ) {
        let payload = match record.encode(config.encoding) {
            Ok(payload) => payload,
            Err(e) => {
                metrics.publish_failures.inc();
                error!(error = %e, "Failed to encode usage record");
                return;
            }
        };
        let key = record.partition_key();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            bucket.acquire().await;

            match producer.publish(&config.topic, key, &payload).await {
                Ok(()) => {
                    metrics.records_published.inc();
                    return;
                }
                Err(e) if config.retry.should_retry(attempt) => {
                    metrics.publish_retries.inc();
                    let delay = config.retry.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, error = %e, "Publish failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics.publish_failures.inc();
                    let err = PublishError::Exhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    };
                    error!(
                        error = %err,
                        resource = %record.resource,
                        feature = %record.feature,
                        bucket_start = %record.bucket_start,
                        amount = %record.total_amount,
                        "Dropping usage record"
                    );
                    return;
                }
            }
        }
    }
}

impl Drop for RateCappedEmitter {
    fn drop(&mut self) {
        // Let the publish loop drain and exit on its own
        self.close();
    }
}
