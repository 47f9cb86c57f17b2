//! Fetch scheduler and accountant running together on real timers

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use usage_accountant::{AccountantConfig, InMemoryProducer, UsageAccountant};
use usage_common::{FetchError, Granularity, Observation};
use usage_fetcher::{DummyArgs, DummyFetcher, FetchScheduler, Fetcher, FetcherConfig, FetcherRegistry};

struct AlwaysFailing;

#[async_trait]
impl Fetcher for AlwaysFailing {
    fn name(&self) -> &str {
        "always-failing"
    }

    async fn get(&self) -> Result<Vec<Observation>, FetchError> {
        Err(FetchError::new("always-failing", "connection refused"))
    }
}

fn fast_accountant() -> (Arc<UsageAccountant>, Arc<InMemoryProducer>) {
    let producer = Arc::new(InMemoryProducer::new());
    let config = AccountantConfig::default()
        .with_granularity(Granularity::new(Duration::from_millis(50)).unwrap())
        .with_flush_period(Duration::from_millis(100))
        .with_max_emit_rate(1000.0);
    let accountant = UsageAccountant::new(config, producer.clone()).unwrap();
    (Arc::new(accountant), producer)
}

#[tokio::test]
async fn test_failing_fetcher_is_isolated() {
    let (accountant, producer) = fast_accountant();
    accountant.start();

    let scheduler = FetchScheduler::new(accountant.clone()).unwrap();
    scheduler.spawn(Arc::new(AlwaysFailing), Duration::from_millis(20));
    scheduler.spawn(
        Arc::new(DummyFetcher::new("healthy", DummyArgs::default()).unwrap()),
        Duration::from_millis(20),
    );

    tokio::time::sleep(Duration::from_millis(600)).await;

    let metrics = scheduler.metrics();
    assert!(metrics.failures.with_label_values(&["always-failing"]).get() >= 5);
    assert!(metrics.observations_delivered.with_label_values(&["healthy"]).get() >= 5);
    assert_eq!(metrics.failures.with_label_values(&["healthy"]).get(), 0);

    // The flush loop kept emitting closed buckets while the failures piled up
    assert!(producer.len() >= 2, "published {}", producer.len());

    scheduler.shutdown(Duration::from_secs(1)).await;
    assert_eq!(accountant.shutdown(Duration::from_secs(1)).await, 0);

    let total: f64 = producer
        .json_payloads()
        .iter()
        .filter_map(|p| p["amount"].as_f64())
        .sum();
    let delivered = metrics.observations_delivered.with_label_values(&["healthy"]).get();
    assert!((total - delivered as f64 * 0.1).abs() < 1e-6);
}

#[tokio::test]
async fn test_resolved_fetchers_feed_accountant() {
    let (accountant, _) = fast_accountant();
    let entries: Vec<FetcherConfig> = serde_json::from_value(serde_json::json!([
        {"type": "dummy", "period_secs": 0.05, "args": {"feature": "search"}},
        {"type": "Dummy", "name": "billing", "period_secs": 0.05, "args": {"feature": "billing"}}
    ]))
    .unwrap();

    let fetchers = FetcherRegistry::with_builtins().resolve(&entries).unwrap();
    let scheduler = FetchScheduler::new(accountant.clone()).unwrap();
    scheduler.start_all(fetchers);
    assert_eq!(scheduler.running(), 2);

    tokio::time::sleep(Duration::from_millis(30)).await;
    scheduler.shutdown(Duration::from_secs(1)).await;

    let metrics = scheduler.metrics();
    assert!(metrics.polls.with_label_values(&["dummy-0"]).get() >= 1);
    assert!(metrics.polls.with_label_values(&["billing"]).get() >= 1);
    assert!(accountant.pending() >= 1);

    accountant.shutdown(Duration::from_secs(1)).await;
}
