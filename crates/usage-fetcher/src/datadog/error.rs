//! Datadog-specific errors.

use thiserror::Error;

/// Datadog-specific errors.
#[derive(Debug, Error)]
pub enum DatadogError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    /// API or application key rejected.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Datadog reported an error for the query.
    #[error("Query error: {0}")]
    QueryError(String),

    /// Body could not be interpreted.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Series scope lacks a required tag.
    #[error("Series scope '{scope}' is missing '{tag}'")]
    MissingScopeTag { scope: String, tag: &'static str },

    /// Unit not representable as a usage unit.
    #[error("Unsupported unit: {0}")]
    UnsupportedUnit(String),

    /// Response carried no series.
    #[error("No timeseries data in response")]
    NoData,
}

impl From<reqwest::Error> for DatadogError {
    fn from(err: reqwest::Error) -> Self {
        DatadogError::HttpError(err.to_string())
    }
}
