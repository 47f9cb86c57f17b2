//! # Usage Accountant
//!
//! Aggregates shared-resource usage observations into time buckets and
//! publishes the bucket totals to a message bus under a hard rate cap.
//!
//! ## Pipeline
//!
//! ```text
//! record() -> Aggregator -> [flush period] -> RateCappedEmitter -> Producer
//! ```
//!
//! - [`Aggregator`]: concurrent map from bucket key to running sum
//! - [`RateCappedEmitter`]: bounded queue, token bucket, retry with backoff
//! - [`UsageAccountant`]: facade owning both plus the flush loop

pub mod accountant;
pub mod aggregator;
pub mod emitter;
pub mod metrics;
pub mod producer;
pub mod retry;

pub use accountant::{AccountantConfig, UsageAccountant};
pub use aggregator::{Aggregate, Aggregator};
pub use emitter::{EmitterConfig, OverflowPolicy, RateCappedEmitter};
pub use metrics::AccountantMetrics;
pub use producer::{InMemoryProducer, LogProducer, NatsProducer, Producer, PublishedMessage};
pub use retry::RetryPolicy;
