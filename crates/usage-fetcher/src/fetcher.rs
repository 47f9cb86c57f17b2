//! Fetcher capability
//!
//! A fetcher is one pollable external source of observations. The scheduler
//! only sees this trait; concrete sources live in their own modules.

use async_trait::async_trait;
use usage_common::{FetchError, Observation};

/// Pollable source of usage observations
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Identity reported with failures and metrics
    fn name(&self) -> &str;

    /// Poll the source once
    ///
    /// An empty batch is a successful poll with nothing to report.
    async fn get(&self) -> Result<Vec<Observation>, FetchError>;
}
