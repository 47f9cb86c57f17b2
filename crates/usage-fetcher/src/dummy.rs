//! Dummy fetcher
//!
//! Reports one fixed observation per poll, stamped with the poll time.
//! Used for smoke tests of a deployment and for scheduler tests.

use crate::fetcher::Fetcher;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;
use usage_common::{AppFeature, FetchError, Observation, ResourceId, UsageUnit};

/// Arguments accepted in the fetcher configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DummyArgs {
    pub resource: ResourceId,
    pub feature: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub unit: UsageUnit,
}

impl Default for DummyArgs {
    fn default() -> Self {
        Self {
            resource: ResourceId::Compute,
            feature: "dummy".to_string(),
            amount: Decimal::new(1, 1),
            unit: UsageUnit::Milliseconds,
        }
    }
}

/// Fixed-value fetcher
#[derive(Debug, Clone)]
pub struct DummyFetcher {
    name: String,
    resource: ResourceId,
    feature: AppFeature,
    amount: Decimal,
    unit: UsageUnit,
}

impl DummyFetcher {
    pub fn new(name: impl Into<String>, args: DummyArgs) -> usage_common::Result<Self> {
        let feature = AppFeature::new(args.feature)?;
        if args.amount.is_sign_negative() {
            return Err(usage_common::AccountantError::Config(format!(
                "dummy amount must not be negative, got {}",
                args.amount
            )));
        }
        Ok(Self {
            name: name.into(),
            resource: args.resource,
            feature,
            amount: args.amount,
            unit: args.unit,
        })
    }
}

#[async_trait]
impl Fetcher for DummyFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> Result<Vec<Observation>, FetchError> {
        debug!(fetcher = %self.name, "Dummy poll");
        let observation = Observation::now(self.resource, self.feature.clone(), self.amount, self.unit)
            .map_err(|e| FetchError::new(&self.name, e.to_string()))?;
        Ok(vec![observation])
    }
}
