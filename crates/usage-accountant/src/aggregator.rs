//! Usage aggregation with DashMap
//!
//! Aggregates observations by resource, feature, unit, and time bucket.
//!
//! The live map is a [`DashMap`] behind a [`RwLock`]. Recorders share the read
//! lock and rely on DashMap's shard locks for the per-key update. A drain
//! takes the write lock to swap in an empty map, so every record lands either
//! in the drained snapshot or in the fresh map.
//!
//! [`Aggregator::seal`] performs the last drain: once it returns, `record`
//! fails with [`AccountantError::Closed`] instead of writing into a map that
//! nothing will drain again.

use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::mem;
use tracing::{debug, instrument};
use usage_common::{AccountantError, BucketKey, Granularity, Observation, Result, UsageRecord};

/// Running sum for one bucket key between flushes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Sum of recorded amounts
    pub total_amount: Decimal,
    /// Number of observations folded in
    pub updates: u64,
}

impl Aggregate {
    fn new(amount: Decimal) -> Self {
        Self {
            total_amount: amount,
            updates: 1,
        }
    }

    fn add(&mut self, amount: Decimal) {
        self.total_amount += amount;
        self.updates += 1;
    }

    fn into_record(self, key: BucketKey, granularity: Granularity) -> UsageRecord {
        UsageRecord {
            resource: key.resource,
            feature: key.feature,
            unit: key.unit,
            bucket_start: key.bucket_start,
            granularity,
            total_amount: self.total_amount,
            observations: self.updates,
        }
    }
}

#[derive(Default)]
struct Live {
    map: DashMap<BucketKey, Aggregate>,
    sealed: bool,
}

/// Time-bucketed usage aggregator
pub struct Aggregator {
    granularity: Granularity,
    live: RwLock<Live>,
}

impl Aggregator {
    /// Create a new aggregator
    pub fn new(granularity: Granularity) -> Self {
        Self {
            granularity,
            live: RwLock::new(Live::default()),
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Add an observation to its bucket, creating the bucket if absent
    pub fn record(&self, observation: &Observation) -> Result<()> {
        let live = self.live.read();
        if live.sealed {
            return Err(AccountantError::Closed("aggregator"));
        }
        observation.validate()?;
        let key = BucketKey::from_observation(observation, self.granularity);

        live.map
            .entry(key)
            .and_modify(|agg| agg.add(observation.amount))
            .or_insert_with(|| Aggregate::new(observation.amount));
        Ok(())
    }

    /// Remove and return every aggregate
    #[instrument(skip(self))]
    pub fn drain(&self) -> Vec<UsageRecord> {
        let snapshot = mem::take(&mut self.live.write().map);
        let records = self.collect_records(snapshot);
        debug!(drained = records.len(), "Drained all aggregates");
        records
    }

    /// Drain everything and reject every later `record`
    #[instrument(skip(self))]
    pub fn seal(&self) -> Vec<UsageRecord> {
        let snapshot = {
            let mut live = self.live.write();
            live.sealed = true;
            mem::take(&mut live.map)
        };
        let records = self.collect_records(snapshot);
        debug!(drained = records.len(), "Sealed aggregator");
        records
    }

    pub fn is_sealed(&self) -> bool {
        self.live.read().sealed
    }

    /// Remove and return aggregates whose bucket ended at or before `now`
    ///
    /// Still-open buckets go back into the live map before the write lock is
    /// released, so a concurrent drain always sees them.
    #[instrument(skip(self))]
    pub fn drain_closed(&self, now: chrono::DateTime<chrono::Utc>) -> Vec<UsageRecord> {
        let mut closed = Vec::new();
        {
            let mut live = self.live.write();
            let snapshot = mem::take(&mut live.map);
            for (key, agg) in snapshot {
                if self.granularity.bucket_end(key.bucket_start) <= now {
                    closed.push(agg.into_record(key, self.granularity));
                } else {
                    live.map.insert(key, agg);
                }
            }
        }

        closed.sort_by(|a, b| a.key().cmp(&b.key()));
        debug!(drained = closed.len(), "Drained closed aggregates");
        closed
    }

    /// Current aggregate for a key
    pub fn pending(&self, key: &BucketKey) -> Option<Aggregate> {
        self.live.read().map.get(key).map(|r| r.clone())
    }

    /// Number of live aggregates
    pub fn len(&self) -> usize {
        self.live.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn collect_records(&self, snapshot: DashMap<BucketKey, Aggregate>) -> Vec<UsageRecord> {
        let mut records: Vec<UsageRecord> = snapshot
            .into_iter()
            .map(|(key, agg)| agg.into_record(key, self.granularity))
            .collect();
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        records
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(Granularity::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use usage_common::{AppFeature, ObservationError, ResourceId, UsageUnit};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn obs(feature: &str, amount: Decimal, secs: i64) -> Observation {
        Observation::new(
            ResourceId::Compute,
            AppFeature::new(feature).unwrap(),
            amount,
            UsageUnit::Milliseconds,
            at(secs),
        )
        .unwrap()
    }

    fn aggregator() -> Aggregator {
        Aggregator::new(Granularity::from_secs(60).unwrap())
    }

    #[test]
    fn test_same_key_sums() {
        let agg = aggregator();
        agg.record(&obs("search", dec!(3), 10)).unwrap();
        agg.record(&obs("search", dec!(4), 50)).unwrap();

        let key = BucketKey::from_observation(&obs("search", dec!(0), 0), agg.granularity());
        let pending = agg.pending(&key).unwrap();
        assert_eq!(pending.total_amount, dec!(7));
        assert_eq!(pending.updates, 2);
    }

    #[test]
    fn test_drain_empties_map() {
        let agg = aggregator();
        assert!(agg.drain().is_empty());

        agg.record(&obs("transactions", dec!(100), 25)).unwrap();
        agg.record(&obs("spans", dec!(200), 45)).unwrap();

        let records = agg.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].feature.as_str(), "spans");
        assert_eq!(records[0].total_amount, dec!(200));
        assert_eq!(records[1].feature.as_str(), "transactions");
        assert_eq!(records[1].total_amount, dec!(100));
        assert!(agg.is_empty());
        assert!(agg.drain().is_empty());
    }

    #[test]
    fn test_disjoint_buckets_not_merged() {
        let agg = aggregator();
        agg.record(&obs("search", dec!(100), 25)).unwrap();
        agg.record(&obs("search", dec!(100), 45)).unwrap();
        agg.record(&obs("search", dec!(100), 105)).unwrap();
        agg.record(&obs("search", dec!(1), 3600)).unwrap();

        let records = agg.drain();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].bucket_start, at(0));
        assert_eq!(records[0].total_amount, dec!(200));
        assert_eq!(records[1].bucket_start, at(60));
        assert_eq!(records[1].total_amount, dec!(100));
        assert_eq!(records[2].bucket_start, at(3600));
        assert_eq!(records[2].total_amount, dec!(1));
    }

    #[test]
    fn test_negative_amount_never_counted() {
        let agg = aggregator();
        let mut bad = obs("search", dec!(1), 10);
        bad.amount = dec!(-5);

        assert!(matches!(
            agg.record(&bad),
            Err(AccountantError::Observation(ObservationError::InvalidObservation(_)))
        ));
        assert!(agg.is_empty());

        agg.record(&obs("search", dec!(2), 10)).unwrap();
        let records = agg.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total_amount, dec!(2));
        assert_eq!(records[0].observations, 1);
    }

    #[test]
    fn test_drain_closed_keeps_open_bucket() {
        let agg = aggregator();
        agg.record(&obs("search", dec!(3), 10)).unwrap();
        agg.record(&obs("search", dec!(4), 50)).unwrap();
        agg.record(&obs("search", dec!(5), 70)).unwrap();

        let records = agg.drain_closed(at(60));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bucket_start, at(0));
        assert_eq!(records[0].total_amount, dec!(7));
        assert_eq!(records[0].granularity, Granularity::from_secs(60).unwrap());

        assert_eq!(agg.len(), 1);
        agg.record(&obs("search", dec!(1), 80)).unwrap();

        let records = agg.drain_closed(at(120));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bucket_start, at(60));
        assert_eq!(records[0].total_amount, dec!(6));
        assert_eq!(records[0].observations, 2);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_key_restarts_after_drain() {
        let agg = aggregator();
        agg.record(&obs("search", dec!(10), 10)).unwrap();
        assert_eq!(agg.drain()[0].total_amount, dec!(10));

        agg.record(&obs("search", dec!(1), 20)).unwrap();
        let records = agg.drain();
        assert_eq!(records[0].total_amount, dec!(1));
        assert_eq!(records[0].observations, 1);
    }

    #[test]
    fn test_concurrent_records_not_lost() {
        let agg = Arc::new(aggregator());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    for _ in 0..125 {
                        agg.record(&obs("search", dec!(1), 10)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let records = agg.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total_amount, dec!(1000));
        assert_eq!(records[0].observations, 1000);
    }

    #[test]
    fn test_concurrent_drain_loses_nothing() {
        let agg = Arc::new(aggregator());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    for _ in 0..2500 {
                        agg.record(&obs("search", dec!(1), 10)).unwrap();
                    }
                })
            })
            .collect();

        let mut total = Decimal::ZERO;
        for _ in 0..50 {
            total += agg.drain().iter().map(|r| r.total_amount).sum::<Decimal>();
        }
        for writer in writers {
            writer.join().unwrap();
        }
        total += agg.drain().iter().map(|r| r.total_amount).sum::<Decimal>();

        assert_eq!(total, dec!(10000));
    }

    #[test]
    fn test_seal_rejects_later_records() {
        let agg = aggregator();
        agg.record(&obs("search", dec!(3), 10)).unwrap();
        agg.record(&obs("search", dec!(5), 70)).unwrap();

        let records = agg.seal();
        assert_eq!(records.len(), 2);
        assert!(agg.is_sealed());
        assert!(matches!(
            agg.record(&obs("search", dec!(1), 10)),
            Err(AccountantError::Closed(_))
        ));
        assert!(agg.is_empty());
        assert!(agg.drain().is_empty());
    }

    #[test]
    fn test_seal_during_concurrent_records_loses_nothing() {
        let agg = Arc::new(aggregator());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    let mut accepted = Decimal::ZERO;
                    for _ in 0..2500 {
                        if agg.record(&obs("search", dec!(1), 10)).is_ok() {
                            accepted += dec!(1);
                        }
                    }
                    accepted
                })
            })
            .collect();

        std::thread::yield_now();
        let sealed: Decimal = agg.seal().iter().map(|r| r.total_amount).sum();
        let accepted: Decimal = writers.into_iter().map(|w| w.join().unwrap()).sum();

        // Every accepted record is in the sealed snapshot
        assert_eq!(sealed, accepted);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_drain_closed_racing_drain_loses_nothing() {
        let agg = Arc::new(aggregator());
        for i in 0..200 {
            agg.record(&obs(&format!("open-{}", i), dec!(1), 70)).unwrap();
        }

        let closer = {
            let agg = agg.clone();
            std::thread::spawn(move || {
                let mut total = Decimal::ZERO;
                for _ in 0..200 {
                    total += agg.drain_closed(at(60)).iter().map(|r| r.total_amount).sum::<Decimal>();
                }
                total
            })
        };
        let mut total = Decimal::ZERO;
        for _ in 0..200 {
            total += agg.drain().iter().map(|r| r.total_amount).sum::<Decimal>();
        }
        total += closer.join().unwrap();
        total += agg.drain().iter().map(|r| r.total_amount).sum::<Decimal>();

        // The t=70 buckets are open at t=60; only the full drains emit them
        assert_eq!(total, dec!(200));
    }

    proptest! {
        #[test]
        fn prop_drain_total_is_exact_sum(
            amounts in prop::collection::vec(0u64..1_000_000, 1..200),
            offsets in prop::collection::vec(0i64..60, 1..200),
        ) {
            let agg = aggregator();
            let mut expected = Decimal::ZERO;
            for (i, amount) in amounts.iter().enumerate() {
                let amount = Decimal::new(*amount as i64, 3);
                let offset = offsets[i % offsets.len()];
                agg.record(&obs("search", amount, 120 + offset)).unwrap();
                expected += amount;
            }

            let records = agg.drain();
            prop_assert_eq!(records.len(), 1);
            prop_assert_eq!(records[0].total_amount, expected);
            prop_assert_eq!(records[0].observations, amounts.len() as u64);
        }
    }
}
