//! Emission payloads
//!
//! A [`UsageRecord`] is the flushed form of one aggregate. It is encoded
//! into a versioned wire message before it reaches the message bus:
//!
//! - [`PayloadEncoding::Json`]: the historical downstream schema
//! - [`PayloadEncoding::Bincode`]: compact binary of the same message

use super::bucket::{BucketKey, Granularity};
use super::observation::AppFeature;
use super::resource::{ResourceId, UsageUnit};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Wire schema version written into every message
pub const SCHEMA_VERSION: u16 = 2;

/// Summary of one flushed aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub resource: ResourceId,
    pub feature: AppFeature,
    pub unit: UsageUnit,
    /// Start of the time bucket
    pub bucket_start: DateTime<Utc>,
    /// Width of the time bucket
    pub granularity: Granularity,
    /// Exact sum of all amounts recorded for the key
    pub total_amount: Decimal,
    /// Number of observations folded into `total_amount`
    pub observations: u64,
}

impl UsageRecord {
    /// Aggregation identity of this record
    pub fn key(&self) -> BucketKey {
        BucketKey {
            bucket_start: self.bucket_start,
            resource: self.resource,
            feature: self.feature.clone(),
            unit: self.unit,
        }
    }

    /// Fold another record for the same key into this one
    pub fn merge(&mut self, other: &UsageRecord) {
        debug_assert_eq!(self.key(), other.key());
        self.total_amount += other.total_amount;
        self.observations += other.observations;
    }

    /// Message key used for bus partitioning: records for the same resource group together
    pub fn partition_key(&self) -> &'static [u8] {
        self.resource.as_str().as_bytes()
    }

    /// Encode into a wire payload
    pub fn encode(&self, encoding: PayloadEncoding) -> Result<Vec<u8>> {
        let message = UsageMessage::from(self);
        match encoding {
            PayloadEncoding::Json => Ok(serde_json::to_vec(&message)?),
            PayloadEncoding::Bincode => Ok(bincode::serialize(&message)?),
        }
    }
}

/// Payload encoding on the bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    Json,
    Bincode,
}

/// Versioned wire message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMessage {
    pub version: u16,
    /// Bucket start, unix seconds
    pub timestamp: i64,
    /// Bucket start, unix milliseconds
    pub timestamp_ms: i64,
    pub granularity_ms: u64,
    pub shared_resource_id: String,
    pub app_feature: String,
    pub usage_unit: UsageUnit,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub observations: u64,
}

impl From<&UsageRecord> for UsageMessage {
    fn from(record: &UsageRecord) -> Self {
        Self {
            version: SCHEMA_VERSION,
            timestamp: record.bucket_start.timestamp(),
            timestamp_ms: record.bucket_start.timestamp_millis(),
            granularity_ms: record.granularity.as_millis().unsigned_abs(),
            shared_resource_id: record.resource.to_string(),
            app_feature: record.feature.to_string(),
            usage_unit: record.unit,
            amount: record.total_amount,
            observations: record.observations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn record(amount: Decimal) -> UsageRecord {
        UsageRecord {
            resource: ResourceId::QueueBytes,
            feature: AppFeature::new("transactions").unwrap(),
            unit: UsageUnit::Bytes,
            bucket_start: Utc.with_ymd_and_hms(2023, 10, 8, 22, 15, 0).unwrap(),
            granularity: Granularity::from_secs(60).unwrap(),
            total_amount: amount,
            observations: 2,
        }
    }

    #[test]
    fn test_merge_sums_amount_and_count() {
        let mut a = record(dec!(100));
        a.merge(&record(dec!(50.5)));
        assert_eq!(a.total_amount, dec!(150.5));
        assert_eq!(a.observations, 4);
    }

    #[test]
    fn test_json_payload_schema() {
        let payload = record(dec!(100)).encode(PayloadEncoding::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(value["version"], 2);
        assert_eq!(value["timestamp"], 1696803300);
        assert_eq!(value["timestamp_ms"], 1696803300000i64);
        assert_eq!(value["granularity_ms"], 60_000);
        assert_eq!(value["shared_resource_id"], "queue-bytes");
        assert_eq!(value["app_feature"], "transactions");
        assert_eq!(value["usage_unit"], "bytes");
        assert_eq!(value["amount"], 100.0);
        assert_eq!(value["observations"], 2);
    }

    #[test]
    fn test_sub_second_bucket_keeps_exact_width() {
        let mut rec = record(dec!(1));
        rec.granularity = Granularity::new(std::time::Duration::from_millis(1500)).unwrap();
        rec.bucket_start = DateTime::from_timestamp_millis(1_696_803_301_500).unwrap();

        let message = UsageMessage::from(&rec);
        assert_eq!(message.granularity_ms, 1500);
        assert_eq!(message.timestamp_ms, 1_696_803_301_500);
        assert_eq!(message.timestamp, 1_696_803_301);
    }

    #[test]
    fn test_bincode_payload_decodes() {
        let rec = record(dec!(7));
        let payload = rec.encode(PayloadEncoding::Bincode).unwrap();
        let message: UsageMessage = bincode::deserialize(&payload).unwrap();
        assert_eq!(message, UsageMessage::from(&rec));
    }

    #[test]
    fn test_partition_key_groups_by_resource() {
        let a = record(dec!(1));
        let mut b = record(dec!(2));
        b.feature = AppFeature::new("spans").unwrap();
        assert_eq!(a.partition_key(), b"queue-bytes");
        assert_eq!(a.partition_key(), b.partition_key());
    }
}
