//! Raw usage observations
//!
//! An [`Observation`] is one usage event reported by a fetcher or a direct
//! caller. It is immutable once built and validated at the boundary.

use super::resource::{ResourceId, UsageUnit};
use crate::error::ObservationError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Product feature responsible for the usage
///
/// Opaque to the engine apart from being non-empty.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppFeature(String);

impl AppFeature {
    pub fn new(name: impl Into<String>) -> Result<Self, ObservationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ObservationError::InvalidObservation(
                "app_feature is required".into(),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One raw usage event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Shared resource consumed
    pub resource: ResourceId,
    /// Feature that caused the consumption
    pub feature: AppFeature,
    /// Amount consumed, never negative
    pub amount: Decimal,
    /// Unit of `amount`
    pub unit: UsageUnit,
    /// When the usage happened
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    /// Create an observation stamped with an explicit time
    pub fn new(
        resource: ResourceId,
        feature: AppFeature,
        amount: Decimal,
        unit: UsageUnit,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, ObservationError> {
        let observation = Self {
            resource,
            feature,
            amount,
            unit,
            observed_at,
        };
        observation.validate()?;
        Ok(observation)
    }

    /// Create an observation stamped with the system clock
    pub fn now(
        resource: ResourceId,
        feature: AppFeature,
        amount: Decimal,
        unit: UsageUnit,
    ) -> Result<Self, ObservationError> {
        Self::new(resource, feature, amount, unit, Utc::now())
    }

    /// Build an observation from untyped inputs, as reported by external sources
    pub fn parse(
        resource: &str,
        feature: &str,
        amount: f64,
        unit: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, ObservationError> {
        let amount = Decimal::try_from(amount).map_err(|_| {
            ObservationError::InvalidObservation(format!("amount {} is not a finite number", amount))
        })?;
        Self::new(
            resource.parse()?,
            AppFeature::new(feature)?,
            amount,
            unit.parse()?,
            observed_at,
        )
    }

    /// Validate the observation
    ///
    /// Fields are public, so callers that assemble an observation by hand
    /// are re-checked on record.
    pub fn validate(&self) -> Result<(), ObservationError> {
        if self.amount < Decimal::ZERO {
            return Err(ObservationError::InvalidObservation(format!(
                "amount {} is negative",
                self.amount
            )));
        }
        if self.feature.as_str().trim().is_empty() {
            return Err(ObservationError::InvalidObservation(
                "app_feature is required".into(),
            ));
        }
        Ok(())
    }
}
