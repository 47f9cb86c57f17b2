//! Message bus producers
//!
//! The accountant only needs `publish(topic, key, payload)`. Connection
//! management and wire protocol belong to the producer.
//!
//! - [`NatsProducer`]: publishes to NATS, key in a `Usage-Key` header
//! - [`LogProducer`]: logs payloads instead of sending them (dry runs)
//! - [`InMemoryProducer`]: captures messages, with scriptable failures

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use usage_common::{AccountantError, PublishError, Result};

/// Header carrying the partition key on NATS messages
pub const KEY_HEADER: &str = "Usage-Key";

/// Publish capability of a message bus
#[async_trait]
pub trait Producer: Send + Sync {
    /// Publish one message
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> std::result::Result<(), PublishError>;

    /// Push out anything buffered client-side
    async fn flush(&self) -> std::result::Result<(), PublishError> {
        Ok(())
    }
}

/// NATS-backed producer
pub struct NatsProducer {
    client: async_nats::Client,
}

impl NatsProducer {
    /// Connect to a NATS server
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| AccountantError::Config(format!("Failed to connect to NATS at {}: {}", url, e)))?;
        info!(url, "Connected to NATS");
        Ok(Self { client })
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Producer for NatsProducer {
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> std::result::Result<(), PublishError> {
        let mut headers = async_nats::HeaderMap::new();
        let key = String::from_utf8_lossy(key);
        headers.insert(KEY_HEADER, key.as_ref());

        self.client
            .publish_with_headers(topic.to_string(), headers, Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))
    }

    async fn flush(&self) -> std::result::Result<(), PublishError> {
        self.client
            .flush()
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))
    }
}

/// Producer that logs instead of publishing
#[derive(Debug, Default)]
pub struct LogProducer;

#[async_trait]
impl Producer for LogProducer {
    #[instrument(skip(self, payload))]
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> std::result::Result<(), PublishError> {
        info!(
            topic,
            key = %String::from_utf8_lossy(key),
            payload = %String::from_utf8_lossy(payload),
            "Dry run: usage record"
        );
        Ok(())
    }
}

/// A message captured by [`InMemoryProducer`]
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    /// When the publish call was made (tokio clock)
    pub at: Instant,
}

/// Producer that keeps messages in memory
#[derive(Debug, Default)]
pub struct InMemoryProducer {
    messages: Mutex<Vec<PublishedMessage>>,
    attempts: AtomicU64,
    fail_next: AtomicU32,
    unavailable: AtomicBool,
}

impl InMemoryProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish calls
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every publish call until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Successfully published messages, in publish order
    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish calls made, including failed ones
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Payloads decoded as JSON
    pub fn json_payloads(&self) -> Vec<serde_json::Value> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| serde_json::from_slice(&m.payload).ok())
            .collect()
    }
}

#[async_trait]
impl Producer for InMemoryProducer {
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> std::result::Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PublishError::Unavailable("bus marked unavailable".into()));
        }
        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted {
            return Err(PublishError::Unavailable("scripted failure".into()));
        }

        self.messages.lock().push(PublishedMessage {
            topic: topic.to_string(),
            key: key.to_vec(),
            payload: payload.to_vec(),
            at: Instant::now(),
        });
        debug!(topic, bytes = payload.len(), "Captured message");
        Ok(())
    }
}
