//! Error types for usage accounting
//!
//! Provides a unified error type and domain-specific error variants.
//! Validation errors surface to the immediate caller; fetch and publish
//! errors are absorbed by the pipeline and only reported.

use thiserror::Error;

/// Result type alias using AccountantError
pub type Result<T> = std::result::Result<T, AccountantError>;

/// Unified error type for usage accounting operations
#[derive(Debug, Error)]
pub enum AccountantError {
    // Rejected observations
    #[error("Observation rejected: {0}")]
    Observation(#[from] ObservationError),

    // External data source errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    // Message bus errors
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    // Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Component already shut down
    #[error("{0} is closed")]
    Closed(&'static str),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Observation validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObservationError {
    #[error("Invalid observation: {0}")]
    InvalidObservation(String),

    #[error("Resource not in allow-list: {0}")]
    UnknownResource(String),

    #[error("Unit not in allow-list: {0}")]
    UnknownUnit(String),
}

/// Failure of one poll of an external data source
#[derive(Debug, Clone, Error)]
#[error("Fetcher '{source_name}' failed: {reason}")]
pub struct FetchError {
    /// Identity of the failing source
    pub source_name: String,
    /// Human readable cause
    pub reason: String,
}

impl FetchError {
    pub fn new(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

/// Message bus publish errors
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    #[error("Publish rejected: {0}")]
    Rejected(String),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl From<serde_json::Error> for AccountantError {
    fn from(err: serde_json::Error) -> Self {
        AccountantError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for AccountantError {
    fn from(err: bincode::Error) -> Self {
        AccountantError::Serialization(err.to_string())
    }
}
