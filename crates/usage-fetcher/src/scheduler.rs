//! Fetch scheduler
//!
//! One task per fetcher, each on its own interval. Ticks that come due while
//! a poll is still in flight are skipped, not queued. Failures (errors and panics)
//! are counted and logged; the fetcher simply tries again on its next tick.
//!
//! ```text
//! Idle -> Fetching -> Delivered -> Idle
//!                  -> Failed    -> Idle
//! ```

use crate::fetcher::Fetcher;
use crate::registry::ScheduledFetcher;
use futures::FutureExt;
use parking_lot::Mutex;
use prometheus::{IntCounterVec, Opts, Registry};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use usage_accountant::UsageAccountant;
use usage_common::{AccountantError, Observation, Result};

/// Per-fetcher counters
pub struct SchedulerMetrics {
    pub polls: IntCounterVec,
    pub failures: IntCounterVec,
    pub observations_delivered: IntCounterVec,
    pub observations_rejected: IntCounterVec,
}

impl SchedulerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            polls: IntCounterVec::new(
                Opts::new("usage_fetcher_polls_total", "Completed polls by fetcher"),
                &["fetcher"],
            )?,
            failures: IntCounterVec::new(
                Opts::new("usage_fetcher_failures_total", "Failed or panicked polls by fetcher"),
                &["fetcher"],
            )?,
            observations_delivered: IntCounterVec::new(
                Opts::new(
                    "usage_fetcher_observations_delivered_total",
                    "Observations accepted by the accountant",
                ),
                &["fetcher"],
            )?,
            observations_rejected: IntCounterVec::new(
                Opts::new(
                    "usage_fetcher_observations_rejected_total",
                    "Observations rejected by the accountant",
                ),
                &["fetcher"],
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.polls.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.observations_delivered.clone()))?;
        registry.register(Box::new(self.observations_rejected.clone()))?;
        Ok(())
    }
}

/// Outcome of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Delivered { accepted: usize, rejected: usize },
    Failed,
}

/// Runs fetchers on independent timers and feeds the accountant
pub struct FetchScheduler {
    accountant: Arc<UsageAccountant>,
    metrics: Arc<SchedulerMetrics>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl FetchScheduler {
    pub fn new(accountant: Arc<UsageAccountant>) -> Result<Self> {
        let metrics =
            SchedulerMetrics::new().map_err(|e| AccountantError::Internal(e.to_string()))?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            accountant,
            metrics: Arc::new(metrics),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.metrics
    }

    /// Number of fetcher tasks still running
    pub fn running(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// Start every resolved fetcher
    pub fn start_all(&self, fetchers: Vec<ScheduledFetcher>) {
        for scheduled in fetchers {
            self.spawn(scheduled.fetcher, scheduled.period);
        }
    }

    /// Start one fetcher on its own timer
    ///
    /// The first poll happens immediately.
    pub fn spawn(&self, fetcher: Arc<dyn Fetcher>, period: Duration) {
        let name = fetcher.name().to_string();
        let accountant = self.accountant.clone();
        let metrics = self.metrics.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_poll_end: Option<Instant> = None;

            loop {
                tokio::select! {
                    scheduled = ticker.tick() => {
                        // The previous poll was still running when this tick came due
                        if matches!(last_poll_end, Some(end) if scheduled < end) {
                            debug!(fetcher = %fetcher.name(), "Skipping tick after overrun");
                            continue;
                        }
                        Self::poll(fetcher.as_ref(), &accountant, &metrics).await;
                        last_poll_end = Some(Instant::now());
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!(fetcher = %fetcher.name(), "Fetcher loop stopped");
        });

        info!(fetcher = %name, ?period, "Fetcher scheduled");
        self.tasks.lock().push((name, handle));
    }

    /// Poll once and deliver the batch
    ///
    /// Errors and panics from the fetcher are absorbed here.
    pub async fn poll(
        fetcher: &dyn Fetcher,
        accountant: &UsageAccountant,
        metrics: &SchedulerMetrics,
    ) -> PollOutcome {
        let name = fetcher.name();
        debug!(fetcher = %name, "Idle -> Fetching");

        let result = AssertUnwindSafe(fetcher.get()).catch_unwind().await;
        metrics.polls.with_label_values(&[name]).inc();

        let observations = match result {
            Ok(Ok(observations)) => observations,
            Ok(Err(e)) => {
                metrics.failures.with_label_values(&[name]).inc();
                warn!(fetcher = %name, error = %e, "Fetching -> Failed");
                return PollOutcome::Failed;
            }
            Err(_) => {
                metrics.failures.with_label_values(&[name]).inc();
                error!(fetcher = %name, "Fetching -> Failed: fetcher panicked");
                return PollOutcome::Failed;
            }
        };

        let (accepted, rejected) = Self::deliver(name, &observations, accountant);
        metrics
            .observations_delivered
            .with_label_values(&[name])
            .inc_by(accepted as u64);
        metrics
            .observations_rejected
            .with_label_values(&[name])
            .inc_by(rejected as u64);
        debug!(fetcher = %name, accepted, rejected, "Fetching -> Delivered");

        PollOutcome::Delivered { accepted, rejected }
    }

    fn deliver(name: &str, observations: &[Observation], accountant: &UsageAccountant) -> (usize, usize) {
        let mut accepted = 0;
        let mut rejected = 0;

        for (i, observation) in observations.iter().enumerate() {
            match accountant.record(observation) {
                Ok(()) => accepted += 1,
                Err(AccountantError::Closed(_)) => {
                    rejected += observations.len() - i;
                    warn!(fetcher = %name, "Accountant closed, dropping the rest of the batch");
                    break;
                }
                Err(e) => {
                    rejected += 1;
                    warn!(fetcher = %name, error = %e, "Observation rejected");
                }
            }
        }
        (accepted, rejected)
    }

    /// Stop ticking, wait for in-flight polls up to `grace`, abort the rest
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown_tx.send_replace(true);
        let deadline = Instant::now() + grace;
        let tasks = std::mem::take(&mut *self.tasks.lock());

        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(fetcher = %name, error = %e, "Fetcher task ended abnormally"),
                Err(_) => {
                    handle.abort();
                    warn!(fetcher = %name, "Poll still in flight at deadline, aborted");
                }
            }
        }
        info!("Fetch scheduler stopped");
    }
}
