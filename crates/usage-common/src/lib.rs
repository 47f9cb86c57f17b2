//! # Usage Common
//!
//! Shared types, wire encodings, and errors for shared-resource usage accounting.
//!
//! ## Core Types
//!
//! - [`ResourceId`] / [`UsageUnit`]: closed sets of resource categories and units
//! - [`AppFeature`]: product feature responsible for usage
//! - [`Observation`]: one raw usage event
//! - [`Granularity`] / [`BucketKey`]: time bucketing and aggregation identity
//! - [`UsageRecord`]: flushed aggregate, encoded as a versioned [`UsageMessage`]

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{AccountantError, FetchError, ObservationError, PublishError, Result};
pub use types::{
    bucket::{BucketKey, Granularity},
    observation::{AppFeature, Observation},
    record::{PayloadEncoding, UsageMessage, UsageRecord, SCHEMA_VERSION},
    resource::{ResourceId, UsageUnit},
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default bus topic for usage records
pub const DEFAULT_TOPIC: &str = "shared-resources-usage";

/// Default bucket width in seconds
pub const DEFAULT_GRANULARITY_SECS: u64 = 60;
