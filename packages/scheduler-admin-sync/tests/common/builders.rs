//! Test data builders

use scheduler_admin_store::Record;
use scheduler_admin_sync::BrokerMessage;

/// Record with a payload, so it is not a tombstone
pub fn schedule(owner: &str, id: &str, epoch: i64, timestamp: i64) -> Record {
    Record::new(owner, id)
        .with_epoch(epoch)
        .with_timestamp(timestamp)
        .with_payload(format!("{}@{}", id, timestamp).into_bytes())
}

/// `count` schedules `<prefix>-000`, `<prefix>-001`, ... with increasing timestamps
pub fn schedules(owner: &str, prefix: &str, count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| schedule(owner, &format!("{}-{:03}", prefix, i), 1_000 + i as i64, 100 + i as i64))
        .collect()
}

/// Broker message carrying a schedule
pub fn schedule_message(topic: &str, id: &str, epoch: i64, timestamp: i64) -> BrokerMessage {
    BrokerMessage::new(topic, id, format!("{}@{}", id, timestamp).into_bytes())
        .with_epoch(epoch)
        .with_target("target-topic", format!("{}-key", id))
        .with_timestamp(timestamp)
}

/// Broker message deleting a schedule
pub fn tombstone_message(topic: &str, id: &str, timestamp: i64) -> BrokerMessage {
    BrokerMessage::new(topic, id, Vec::new()).with_timestamp(timestamp)
}
