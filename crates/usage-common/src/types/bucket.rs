//! Time bucketing
//!
//! Maps observation timestamps onto fixed-width buckets and forms the
//! aggregation identity of an observation.

use super::observation::{AppFeature, Observation};
use super::resource::{ResourceId, UsageUnit};
use crate::error::{AccountantError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Width of an aggregation bucket
///
/// Buckets are cut on millisecond boundaries, so the width must be a
/// positive whole number of milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Duration", into = "Duration")]
pub struct Granularity(Duration);

impl Granularity {
    pub fn new(width: Duration) -> Result<Self> {
        if width.as_millis() == 0 {
            return Err(AccountantError::Config(format!(
                "granularity must be positive, got {:?}",
                width
            )));
        }
        if width.subsec_nanos() % 1_000_000 != 0 {
            return Err(AccountantError::Config(format!(
                "granularity must be a whole number of milliseconds, got {:?}",
                width
            )));
        }
        Ok(Self(width))
    }

    pub fn from_secs(secs: u64) -> Result<Self> {
        Self::new(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_millis(&self) -> i64 {
        i64::try_from(self.0.as_millis()).unwrap_or(i64::MAX)
    }

    /// `floor(at / granularity) * granularity`
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.as_millis();
        let start = at.timestamp_millis().div_euclid(width) * width;
        DateTime::from_timestamp_millis(start).unwrap_or(at)
    }

    /// Exclusive end of the bucket starting at `bucket_start`
    pub fn bucket_end(&self, bucket_start: DateTime<Utc>) -> DateTime<Utc> {
        bucket_start + chrono::Duration::milliseconds(self.as_millis())
    }
}

impl TryFrom<Duration> for Granularity {
    type Error = AccountantError;

    fn try_from(width: Duration) -> Result<Self> {
        Self::new(width)
    }
}

impl From<Granularity> for Duration {
    fn from(granularity: Granularity) -> Self {
        granularity.0
    }
}

impl Default for Granularity {
    fn default() -> Self {
        Self(Duration::from_secs(crate::DEFAULT_GRANULARITY_SECS))
    }
}

/// Aggregation identity
///
/// Two observations aggregate together iff all four fields match.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    /// Start of the time bucket (field order drives `Ord`: time first)
    pub bucket_start: DateTime<Utc>,
    pub resource: ResourceId,
    pub feature: AppFeature,
    pub unit: UsageUnit,
}

impl BucketKey {
    /// Create a key from an observation
    pub fn from_observation(observation: &Observation, granularity: Granularity) -> Self {
        Self {
            bucket_start: granularity.bucket_start(observation.observed_at),
            resource: observation.resource,
            feature: observation.feature.clone(),
            unit: observation.unit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_zero_granularity_rejected() {
        assert!(Granularity::new(Duration::ZERO).is_err());
        assert!(Granularity::new(Duration::from_micros(10)).is_err());
        assert!(Granularity::from_secs(60).is_ok());
    }

    #[test]
    fn test_fractional_millisecond_granularity_rejected() {
        let err = Granularity::new(Duration::from_micros(1500)).unwrap_err();
        assert!(matches!(err, AccountantError::Config(_)));
        assert!(Granularity::new(Duration::from_millis(1500)).is_ok());
        assert!(Granularity::new(Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn test_deserialize_validates_width() {
        let ok: Granularity = serde_json::from_str(r#"{"secs":1,"nanos":500000000}"#).unwrap();
        assert_eq!(ok.as_millis(), 1500);
        assert!(serde_json::from_str::<Granularity>(r#"{"secs":0,"nanos":1500000}"#).is_err());
        assert!(serde_json::from_str::<Granularity>(r#"{"secs":0,"nanos":0}"#).is_err());
    }

    #[test]
    fn test_bucket_start_floors() {
        let g = Granularity::from_secs(60).unwrap();
        assert_eq!(g.bucket_start(at(10)), at(0));
        assert_eq!(g.bucket_start(at(59)), at(0));
        assert_eq!(g.bucket_start(at(60)), at(60));
        assert_eq!(g.bucket_start(at(70)), at(60));
        assert_eq!(g.bucket_end(at(60)), at(120));
    }

    #[test]
    fn test_bucket_start_before_epoch() {
        let g = Granularity::from_secs(60).unwrap();
        assert_eq!(g.bucket_start(at(-1)), at(-60));
        assert_eq!(g.bucket_start(at(-60)), at(-60));
    }

    #[test]
    fn test_bucket_start_wall_clock() {
        let g = Granularity::from_secs(60).unwrap();
        let t = Utc.with_ymd_and_hms(2023, 10, 8, 22, 15, 25).unwrap();
        assert_eq!(
            g.bucket_start(t),
            Utc.with_ymd_and_hms(2023, 10, 8, 22, 15, 0).unwrap()
        );
    }

    #[test]
    fn test_key_from_observation() {
        let g = Granularity::from_secs(60).unwrap();
        let feature = AppFeature::new("search").unwrap();
        let a = Observation::new(ResourceId::Compute, feature.clone(), dec!(3), UsageUnit::Milliseconds, at(10)).unwrap();
        let b = Observation::new(ResourceId::Compute, feature.clone(), dec!(4), UsageUnit::Milliseconds, at(50)).unwrap();
        let c = Observation::new(ResourceId::Compute, feature, dec!(5), UsageUnit::Milliseconds, at(70)).unwrap();

        assert_eq!(BucketKey::from_observation(&a, g), BucketKey::from_observation(&b, g));
        assert_ne!(BucketKey::from_observation(&a, g), BucketKey::from_observation(&c, g));
    }
}
