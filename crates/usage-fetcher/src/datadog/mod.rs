//! Datadog fetcher.
//!
//! Polls the Datadog v1 timeseries query API for each configured query over
//! the trailing window and reports every point as an observation. Queries
//! must group by the `shared_resource_id` and `app_feature` tags.
//!
//! Keys are read from environment variables named in the fetcher args
//! (`DATADOG_API_KEY` / `DATADOG_APP_KEY` by default).

mod api;
mod error;
pub(crate) mod parser;

pub use api::{DatadogApiClient, QueryResponse, Series, SeriesUnit, DATADOG_API_BASE};
pub use error::DatadogError;

use crate::fetcher::Fetcher;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, instrument};
use usage_common::{AccountantError, FetchError, Observation, ResourceId};

/// One query to poll.
#[derive(Debug, Clone, Deserialize)]
pub struct DatadogQuery {
    pub query: String,
    /// Unit to report; taken from the response when absent.
    #[serde(default)]
    pub unit: Option<String>,
    /// Resource for series whose `shared_resource_id` is not a known resource.
    #[serde(default)]
    pub resource: Option<ResourceId>,
}

/// Arguments accepted in the fetcher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatadogArgs {
    pub queries: Vec<DatadogQuery>,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_app_key_env")]
    pub app_key_env: String,

    /// Trailing query window; the poll period when absent.
    #[serde(default)]
    pub window_secs: Option<u64>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    DATADOG_API_BASE.to_string()
}

fn default_api_key_env() -> String {
    "DATADOG_API_KEY".to_string()
}

fn default_app_key_env() -> String {
    "DATADOG_APP_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Datadog-backed fetcher.
#[derive(Debug)]
pub struct DatadogFetcher {
    name: String,
    client: DatadogApiClient,
    queries: Vec<DatadogQuery>,
    window: Duration,
}

impl DatadogFetcher {
    /// Build a fetcher, reading keys from the environment.
    ///
    /// `period` is the default query window.
    pub fn new(name: impl Into<String>, args: DatadogArgs, period: Duration) -> usage_common::Result<Self> {
        let api_key = std::env::var(&args.api_key_env).unwrap_or_default();
        let app_key = std::env::var(&args.app_key_env).unwrap_or_default();
        let client = DatadogApiClient::new(
            args.base_url.clone(),
            api_key,
            app_key,
            Duration::from_secs(args.timeout_secs),
        )
        .map_err(|e| AccountantError::Config(e.to_string()))?;

        Self::with_client(name, args, period, client)
    }

    /// Build a fetcher around an existing client.
    pub fn with_client(
        name: impl Into<String>,
        args: DatadogArgs,
        period: Duration,
        client: DatadogApiClient,
    ) -> usage_common::Result<Self> {
        let name = name.into();

        if args.queries.is_empty() {
            return Err(AccountantError::Config(format!("{}: at least one query is required", name)));
        }
        for q in &args.queries {
            if !parser::is_valid_query(&q.query) {
                return Err(AccountantError::Config(format!(
                    "{}: query must reference {} and {}: {}",
                    name,
                    parser::RESOURCE_TAG,
                    parser::FEATURE_TAG,
                    q.query
                )));
            }
        }

        let window = args.window_secs.map(Duration::from_secs).unwrap_or(period);
        // The query API takes whole unix seconds.
        if window < Duration::from_secs(1) {
            return Err(AccountantError::Config(format!(
                "{}: query window must be at least 1s, got {:?}",
                name, window
            )));
        }

        info!(fetcher = %name, queries = args.queries.len(), ?window, "Datadog fetcher configured");
        Ok(Self {
            name,
            client,
            queries: args.queries,
            window,
        })
    }

    async fn poll_query(&self, query: &DatadogQuery, from: i64, to: i64) -> Result<Vec<Observation>, DatadogError> {
        let response = self.client.query(&query.query, from, to).await?;
        let series = parser::response_series(response)?;
        let unit = parser::resolve_unit(&series, query.unit.as_deref())?;
        parser::series_observations(&series, unit, query.resource)
    }
}

#[async_trait]
impl Fetcher for DatadogFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self))]
    async fn get(&self) -> Result<Vec<Observation>, FetchError> {
        let to = Utc::now().timestamp();
        let from = to - self.window.as_secs() as i64;

        let mut observations = Vec::new();
        for query in &self.queries {
            let batch = self
                .poll_query(query, from, to)
                .await
                .map_err(|e| FetchError::new(&self.name, format!("{} (query: {})", e, query.query)))?;
            observations.extend(batch);
        }

        debug!(fetcher = %self.name, count = observations.len(), "Datadog poll complete");
        Ok(observations)
    }
}
