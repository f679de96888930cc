//! Kafka consumers over librdkafka
//!
//! Enabled by the `kafka` feature. Each owner gets its own
//! [`StreamConsumer`] against the owner's bootstrap servers, reading from the
//! earliest offset without committing, so a restart replays the topics.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use tracing::debug;

use super::broker::{BrokerMessage, ConsumerFactory, MessageConsumer};
use super::bucket::Bucket;

const SESSION_TIMEOUT_MS: &str = "6000";

/// Creates one [`StreamConsumer`] per owner
#[derive(Debug, Clone, Default)]
pub struct KafkaConsumerFactory {
    /// Extra client properties, applied last
    overrides: Vec<(String, String)>,
}

impl KafkaConsumerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a librdkafka property on every consumer, e.g. `security.protocol`.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    fn client_config(&self, bucket: &Bucket, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &bucket.bootstrap_servers)
            .set("group.id", group_id)
            .set("session.timeout.ms", SESSION_TIMEOUT_MS)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");
        for (key, value) in &self.overrides {
            config.set(key, value);
        }
        config
    }
}

impl ConsumerFactory for KafkaConsumerFactory {
    fn create(&self, bucket: &Bucket, group_id: &str) -> anyhow::Result<Box<dyn MessageConsumer>> {
        let consumer: StreamConsumer = self.client_config(bucket, group_id).create()?;
        debug!(
            owner = %bucket.owner_id,
            servers = %bucket.bootstrap_servers,
            group_id,
            "kafka consumer created"
        );
        Ok(Box::new(KafkaConsumer { consumer }))
    }
}

struct KafkaConsumer {
    consumer: StreamConsumer,
}

#[async_trait]
impl MessageConsumer for KafkaConsumer {
    async fn subscribe(&mut self, topics: &[String]) -> anyhow::Result<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> anyhow::Result<Option<BrokerMessage>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok(message)) => Ok(Some(to_broker_message(&message))),
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

/// Copy a consumed message out of librdkafka.
///
/// A message without a broker timestamp is stamped with the receive time.
fn to_broker_message<M: Message>(message: &M) -> BrokerMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    let value = header.value.map(<[u8]>::to_vec).unwrap_or_default();
                    (header.key.to_string(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    BrokerMessage {
        topic: message.topic().to_string(),
        key: message.key().map(|key| String::from_utf8_lossy(key).into_owned()),
        value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
        timestamp: message
            .timestamp()
            .to_millis()
            .map(|millis| millis / 1000)
            .unwrap_or_else(|| Utc::now().timestamp()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::broker::{HEADER_EPOCH, HEADER_TARGET_KEY, HEADER_TARGET_TOPIC};
    use rdkafka::message::{Header, OwnedHeaders, OwnedMessage, Timestamp};

    fn owned(key: Option<&str>, payload: Option<&str>, headers: OwnedHeaders) -> OwnedMessage {
        OwnedMessage::new(
            payload.map(|p| p.as_bytes().to_vec()),
            key.map(|k| k.as_bytes().to_vec()),
            "schedules".to_string(),
            Timestamp::CreateTime(1_690_000_000_500),
            0,
            42,
            Some(headers),
        )
    }

    #[test]
    fn test_message_becomes_record() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: HEADER_EPOCH,
                value: Some("1700000000"),
            })
            .insert(Header {
                key: HEADER_TARGET_TOPIC,
                value: Some("jobs"),
            })
            .insert(Header {
                key: HEADER_TARGET_KEY,
                value: Some("job-1"),
            });
        let message = to_broker_message(&owned(Some("schedule-1"), Some("{}"), headers));

        assert_eq!(message.timestamp, 1_690_000_000);
        assert!(!message.is_tombstone());

        let record = message.into_record("s1").unwrap();
        assert_eq!(record.id, "schedule-1");
        assert_eq!(record.epoch, 1_700_000_000);
        assert_eq!(record.topic, "schedules");
        assert_eq!(record.target_topic, "jobs");
        assert_eq!(record.target_key, "job-1");
        assert_eq!(record.payload, b"{}".to_vec());
    }

    #[test]
    fn test_null_payload_is_tombstone() {
        let message = to_broker_message(&owned(Some("schedule-1"), None, OwnedHeaders::new()));
        assert!(message.is_tombstone());
        assert!(message.headers.is_empty());
    }

    #[test]
    fn test_client_config() {
        let factory = KafkaConsumerFactory::new().with_option("auto.offset.reset", "latest");
        let bucket = Bucket::new("s1", "kafka-1:9092", ["schedules"]);
        let config = factory.client_config(&bucket, "scheduler-admin-cg");

        assert_eq!(config.get("bootstrap.servers"), Some("kafka-1:9092"));
        assert_eq!(config.get("group.id"), Some("scheduler-admin-cg"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
    }
}
