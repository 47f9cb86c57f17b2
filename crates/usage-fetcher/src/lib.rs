//! # Usage Fetcher
//!
//! Polls external usage sources on independent timers and feeds the
//! observations into a [`usage_accountant::UsageAccountant`].
//!
//! - [`Fetcher`]: one pollable source (dummy, Datadog, or your own)
//! - [`FetcherRegistry`]: type name to constructor, resolved at startup
//! - [`FetchScheduler`]: one task per fetcher with per-fetcher failure isolation
//! - [`DaemonConfig`]: file and environment configuration for the binary

pub mod config;
pub mod datadog;
pub mod dummy;
pub mod fetcher;
pub mod registry;
pub mod scheduler;

pub use crate::config::{DaemonConfig, FetcherConfig};
pub use datadog::{DatadogArgs, DatadogFetcher, DatadogQuery};
pub use dummy::{DummyArgs, DummyFetcher};
pub use fetcher::Fetcher;
pub use registry::{FetcherContext, FetcherRegistry, ScheduledFetcher};
pub use scheduler::{FetchScheduler, PollOutcome, SchedulerMetrics};
