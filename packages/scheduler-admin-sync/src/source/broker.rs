//! Broker seam
//!
//! Consumption goes through [`ConsumerFactory`] and [`MessageConsumer`], so
//! the topology logic never depends on a concrete client. [`MemoryBroker`]
//! is the in-process implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use scheduler_admin_store::Record;
use tokio::sync::Notify;
use tracing::debug;

use super::bucket::Bucket;
use crate::error::{Result, SyncError};

pub const HEADER_EPOCH: &str = "scheduler-epoch";
pub const HEADER_TARGET_TOPIC: &str = "scheduler-target-topic";
pub const HEADER_TARGET_KEY: &str = "scheduler-target-key";

/// One consumed message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrokerMessage {
    pub topic: String,
    /// Schedule id
    pub key: Option<String>,
    /// Schedule payload, empty for a tombstone
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
    /// Unix seconds
    pub timestamp: i64,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: Some(key.into()),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_epoch(self, epoch: i64) -> Self {
        self.with_header(HEADER_EPOCH, epoch.to_string())
    }

    pub fn with_target(self, topic: impl Into<String>, key: impl Into<String>) -> Self {
        self.with_header(HEADER_TARGET_TOPIC, topic.into())
            .with_header(HEADER_TARGET_KEY, key.into())
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Value of the last header named `name`.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    fn header_str(&self, name: &str) -> String {
        self.header(name)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default()
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }

    /// Record of `owner_id` carried by this message.
    ///
    /// The key is the schedule id and is required; a missing or malformed
    /// epoch header reads as epoch 0.
    pub fn into_record(self, owner_id: &str) -> Result<Record> {
        let epoch = self
            .header_str(HEADER_EPOCH)
            .trim()
            .parse::<i64>()
            .unwrap_or(0);
        let target_topic = self.header_str(HEADER_TARGET_TOPIC);
        let target_key = self.header_str(HEADER_TARGET_KEY);
        let id = self
            .key
            .ok_or_else(|| SyncError::broker(format!("message from {} has no key", self.topic)))?;

        Ok(Record::new(owner_id, id)
            .with_epoch(epoch)
            .with_timestamp(self.timestamp)
            .with_topic(self.topic)
            .with_target(target_topic, target_key)
            .with_payload(self.value))
    }
}

/// A subscribed consumer of one owner's topics
#[async_trait]
pub trait MessageConsumer: Send {
    async fn subscribe(&mut self, topics: &[String]) -> anyhow::Result<()>;

    /// Next message, or `None` once `timeout` passed without one.
    async fn poll(&mut self, timeout: Duration) -> anyhow::Result<Option<BrokerMessage>>;

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait ConsumerFactory: Send + Sync {
    fn create(&self, bucket: &Bucket, group_id: &str) -> anyhow::Result<Box<dyn MessageConsumer>>;
}

type LogKey = (String, String);

#[derive(Default)]
struct BrokerInner {
    logs: Mutex<HashMap<LogKey, Vec<BrokerMessage>>>,
    appended: Notify,
}

/// In-process broker
///
/// Topic logs are keyed by bootstrap servers and topic, so two owners only
/// share a log when they share coordinates. Every consumer reads from the
/// earliest offset.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message` to its topic on `bootstrap_servers`.
    ///
    /// A message without a timestamp is stamped with the append time.
    pub fn produce(&self, bootstrap_servers: &str, mut message: BrokerMessage) {
        if message.timestamp == 0 {
            message.timestamp = Utc::now().timestamp();
        }
        let key = (bootstrap_servers.to_string(), message.topic.clone());
        self.inner.logs.lock().entry(key).or_default().push(message);
        self.inner.appended.notify_waiters();
    }

    /// Number of messages in a topic log.
    pub fn len(&self, bootstrap_servers: &str, topic: &str) -> usize {
        self.inner
            .logs
            .lock()
            .get(&(bootstrap_servers.to_string(), topic.to_string()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, bootstrap_servers: &str, topic: &str) -> bool {
        self.len(bootstrap_servers, topic) == 0
    }
}

impl ConsumerFactory for MemoryBroker {
    fn create(&self, bucket: &Bucket, group_id: &str) -> anyhow::Result<Box<dyn MessageConsumer>> {
        debug!(owner = %bucket.owner_id, group_id, "memory consumer created");
        Ok(Box::new(MemoryConsumer {
            broker: Arc::clone(&self.inner),
            bootstrap_servers: bucket.bootstrap_servers.clone(),
            offsets: Vec::new(),
        }))
    }
}

struct MemoryConsumer {
    broker: Arc<BrokerInner>,
    bootstrap_servers: String,
    /// (topic, next offset) per subscribed topic
    offsets: Vec<(String, usize)>,
}

impl MemoryConsumer {
    fn next_message(&mut self) -> Option<BrokerMessage> {
        let logs = self.broker.logs.lock();
        for (topic, offset) in self.offsets.iter_mut() {
            let key = (self.bootstrap_servers.clone(), topic.clone());
            if let Some(message) = logs.get(&key).and_then(|log| log.get(*offset)) {
                *offset += 1;
                return Some(message.clone());
            }
        }
        None
    }
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    async fn subscribe(&mut self, topics: &[String]) -> anyhow::Result<()> {
        if topics.is_empty() {
            anyhow::bail!("no topics to subscribe to");
        }
        self.offsets = topics.iter().map(|t| (t.clone(), 0)).collect();
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> anyhow::Result<Option<BrokerMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let broker = Arc::clone(&self.broker);
            let appended = broker.appended.notified();
            tokio::pin!(appended);
            // register before checking, so an append in between is not missed
            appended.as_mut().enable();

            if let Some(message) = self.next_message() {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_record() {
        let message = BrokerMessage::new("schedules", "schedule-1", b"payload".to_vec())
            .with_epoch(1_700_000_000)
            .with_target("target", "target-key")
            .with_timestamp(42);

        let record = message.into_record("s1").unwrap();
        assert_eq!(record.owner_id, "s1");
        assert_eq!(record.id, "schedule-1");
        assert_eq!(record.epoch, 1_700_000_000);
        assert_eq!(record.timestamp, 42);
        assert_eq!(record.topic, "schedules");
        assert_eq!(record.target_topic, "target");
        assert_eq!(record.target_key, "target-key");
        assert!(!record.is_tombstone());
    }

    #[test]
    fn test_bad_epoch_reads_as_zero() {
        let message = BrokerMessage::new("t", "a", Vec::new()).with_header(HEADER_EPOCH, "soon");
        let record = message.into_record("s1").unwrap();
        assert_eq!(record.epoch, 0);
        assert!(record.is_tombstone());
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let message = BrokerMessage {
            topic: "t".to_string(),
            ..Default::default()
        };
        assert!(matches!(message.into_record("s1"), Err(SyncError::Broker(_))));
    }

    #[tokio::test]
    async fn test_memory_consumer_reads_from_earliest() {
        let broker = MemoryBroker::new();
        broker.produce("b1", BrokerMessage::new("t1", "a", b"x".to_vec()));
        broker.produce("b2", BrokerMessage::new("t1", "other-cluster", b"x".to_vec()));

        let bucket = Bucket::new("s1", "b1", ["t1"]);
        let mut consumer = broker.create(&bucket, "cg").unwrap();
        consumer.subscribe(&bucket.topics).await.unwrap();

        let first = consumer.poll(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.and_then(|m| m.key), Some("a".to_string()));
        assert!(consumer.poll(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_produce_stamps_append_time() {
        let broker = MemoryBroker::new();
        broker.produce("b1", BrokerMessage::new("t1", "a", b"x".to_vec()));
        broker.produce("b1", BrokerMessage::new("t1", "b", b"x".to_vec()).with_timestamp(7));

        let bucket = Bucket::new("s1", "b1", ["t1"]);
        let mut consumer = broker.create(&bucket, "cg").unwrap();
        consumer.subscribe(&bucket.topics).await.unwrap();

        let stamped = consumer.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert!(stamped.timestamp > 1_600_000_000);
        let kept = consumer.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(kept.timestamp, 7);
    }

    #[tokio::test]
    async fn test_poll_wakes_on_produce() {
        let broker = MemoryBroker::new();
        let bucket = Bucket::new("s1", "b1", ["t1"]);
        let mut consumer = broker.create(&bucket, "cg").unwrap();
        consumer.subscribe(&bucket.topics).await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce("b1", BrokerMessage::new("t1", "late", b"x".to_vec()));
        });

        let message = consumer.poll(Duration::from_secs(5)).await.unwrap();
        assert_eq!(message.and_then(|m| m.key), Some("late".to_string()));
    }
}
