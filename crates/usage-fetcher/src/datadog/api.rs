//! Datadog metrics query API client.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::error::DatadogError;

// ============================================================================
// Constants
// ============================================================================

/// Datadog API base URL.
pub const DATADOG_API_BASE: &str = "https://api.datadoghq.com";

/// Timeseries query endpoint.
const QUERY_ENDPOINT: &str = "/api/v1/query";

const API_KEY_HEADER: &str = "DD-API-KEY";
const APP_KEY_HEADER: &str = "DD-APPLICATION-KEY";

// ============================================================================
// API Response Types
// ============================================================================

/// Response from the timeseries query endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub query: Option<String>,

    /// Window start, unix milliseconds.
    #[serde(default)]
    pub from_date: Option<i64>,

    /// Window end, unix milliseconds.
    #[serde(default)]
    pub to_date: Option<i64>,

    #[serde(default)]
    pub series: Option<Vec<Series>>,
}

/// One timeseries of a query response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Series {
    /// Up to two units (base and per-unit); either slot may be null.
    #[serde(default)]
    pub unit: Option<Vec<Option<SeriesUnit>>>,

    /// Comma separated `tag: value` pairs identifying the series.
    #[serde(default)]
    pub scope: String,

    /// `[timestamp_ms, value]` pairs; gaps carry a null value.
    #[serde(default)]
    pub pointlist: Vec<(f64, Option<f64>)>,

    #[serde(default)]
    pub metric: Option<String>,
}

/// Unit descriptor attached to a series.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeriesUnit {
    #[serde(default)]
    pub family: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub plural: Option<String>,
}

// ============================================================================
// API Client
// ============================================================================

/// Datadog API client.
#[derive(Debug, Clone)]
pub struct DatadogApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    app_key: String,
}

impl DatadogApiClient {
    /// Creates a new client.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        app_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DatadogError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DatadogError::HttpError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            app_key: app_key.into(),
        })
    }

    /// Build request headers.
    fn build_headers(&self) -> Result<HeaderMap, DatadogError> {
        let mut headers = HeaderMap::new();

        headers.insert(USER_AGENT, HeaderValue::from_static("usage-fetcher/0.1"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            API_KEY_HEADER,
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| DatadogError::AuthenticationFailed(format!("Invalid API key: {}", e)))?,
        );
        headers.insert(
            APP_KEY_HEADER,
            HeaderValue::from_str(&self.app_key).map_err(|e| {
                DatadogError::AuthenticationFailed(format!("Invalid application key: {}", e))
            })?,
        );

        Ok(headers)
    }

    /// Query timeseries points over `[from, to]` (unix seconds).
    #[instrument(skip(self))]
    pub async fn query(&self, query: &str, from: i64, to: i64) -> Result<QueryResponse, DatadogError> {
        debug!("Querying Datadog");

        let url = format!("{}{}", self.base_url, QUERY_ENDPOINT);
        let headers = self.build_headers()?;

        let response = self
            .http
            .get(&url)
            .headers(headers)
            .query(&[
                ("query", query.to_string()),
                ("from", from.to_string()),
                ("to", to.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(DatadogError::AuthenticationFailed(format!("HTTP {}", status)));
        }

        let body = response.text().await?;

        if !status.is_success() {
            // Datadog puts query errors in a JSON body on 4xx responses
            if let Ok(parsed) = serde_json::from_str::<QueryResponse>(&body) {
                if let Some(error) = parsed.error {
                    return Err(DatadogError::QueryError(error));
                }
            }
            return Err(DatadogError::InvalidResponse(format!("HTTP {}", status)));
        }

        serde_json::from_str(&body).map_err(|e| {
            warn!(error = %e, "Failed to parse query response");
            DatadogError::InvalidResponse(format!("JSON error: {}", e))
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client =
            DatadogApiClient::new("https://example.com/", "api", "app", Duration::from_secs(5))
                .unwrap();
        assert_eq!(client.base_url, "https://example.com");
    }

    #[test]
    fn test_rejects_unprintable_key() {
        let client =
            DatadogApiClient::new(DATADOG_API_BASE, "bad\nkey", "app", Duration::from_secs(5))
                .unwrap();
        assert!(matches!(
            client.build_headers(),
            Err(DatadogError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_parse_response_with_gaps() {
        let json = r#"{
            "status": "ok",
            "series": [{
                "unit": [{"plural": "bytes", "name": "byte"}, null],
                "scope": "app_feature: shared, shared_resource_id: cache",
                "pointlist": [[1721083885000.0, 2.5], [1721083890000.0, null]]
            }]
        }"#;

        let response: QueryResponse = serde_json::from_str(json).unwrap();
        let series = &response.series.unwrap()[0];
        assert_eq!(series.pointlist.len(), 2);
        assert_eq!(series.pointlist[1].1, None);
        let units = series.unit.as_ref().unwrap();
        assert_eq!(units[0].as_ref().unwrap().plural.as_deref(), Some("bytes"));
        assert!(units[1].is_none());
    }
}
