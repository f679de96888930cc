//! Domain layer: records, events and the store ports
//!
//! # Domain Models
//!
//! - `Record`: one version of a scheduled item, keyed by `(owner_id, id)`
//! - `Event`: closed set of changes flowing from a source to the stores
//!
//! # Port Traits
//!
//! - `Store`: point lookup (all versions) and owner scan (newest versions)
//! - `MutableStore`: direct writes (`add` prepends, `delete` drops the key)
//! - `Watchable`: a single-subscriber stream of `Event`s
//! - `Batchable`: coalesced writes from an event stream, errors reported on a stream
//!
//! # Examples
//!
//! ```rust,ignore
//! use scheduler_admin_store::{Record, MutableStore, Store};
//!
//! async fn example(store: impl MutableStore) -> Result<()> {
//!     let v1 = Record::new("scheduler-1", "schedule-1").with_payload(b"v1".to_vec());
//!     let v2 = Record::new("scheduler-1", "schedule-1").with_payload(b"v2".to_vec());
//!     store.add("scheduler-1", vec![v1, v2]).await?;
//!
//!     // newest first
//!     let versions = store.get("scheduler-1", "schedule-1").await?;
//!     assert_eq!(versions[0].payload, b"v2");
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{Result, StoreError};

/// Separator between owner and id in a composite key.
pub const KEY_SEPARATOR: char = '|';

/// Build the composite key `owner|id` used to tell identical ids of
/// different owners apart.
pub fn composite_key(owner_id: &str, id: &str) -> String {
    let mut key = String::with_capacity(owner_id.len() + id.len() + 1);
    key.push_str(owner_id);
    key.push(KEY_SEPARATOR);
    key.push_str(id);
    key
}

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// One version of a scheduled item
///
/// `epoch` is the target time of the schedule and `timestamp` the time it was
/// last modified, both unix seconds. An empty payload marks a tombstone.
///
/// The JSON form is the list view shape: owner and payload are not part of it.
///
/// # Examples
///
/// ```rust
/// use scheduler_admin_store::Record;
///
/// let record = Record::new("scheduler-1", "schedule-1").with_epoch(1_700_000_000);
/// assert!(record.is_tombstone());
/// assert_eq!(record.composite_key(), "scheduler-1|schedule-1");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Producing scheduler instance
    #[serde(skip)]
    pub owner_id: String,
    /// Schedule id, unique within an owner
    pub id: String,
    pub epoch: i64,
    pub timestamp: i64,
    /// Topic the record was consumed from
    #[serde(default)]
    pub topic: String,
    #[serde(rename = "target-topic", default)]
    pub target_topic: String,
    #[serde(rename = "target-key", default)]
    pub target_key: String,
    #[serde(skip)]
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(owner_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_epoch(mut self, epoch: i64) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_target(mut self, topic: impl Into<String>, key: impl Into<String>) -> Self {
        self.target_topic = topic.into();
        self.target_key = key.into();
        self
    }

    /// A record without payload is a logical delete.
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn composite_key(&self) -> String {
        composite_key(&self.owner_id, &self.id)
    }
}

/// Kind tag of an [`Event`], used for logging and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Upsert,
    Delete,
    Reset,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Upsert => "upsert",
            EventKind::Delete => "delete",
            EventKind::Reset => "reset",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change to an owner's records
///
/// Events of one owner are ordered by their producer. Nothing is assumed about
/// the relative order of events of different owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Upsert(Record),
    Delete(Record),
    /// The owner's upstream was reinitialized; all derived state must go.
    Reset { owner_id: String },
}

impl Event {
    /// Upsert for a record with payload, Delete for a tombstone.
    pub fn from_record(record: Record) -> Self {
        if record.is_tombstone() {
            Event::Delete(record)
        } else {
            Event::Upsert(record)
        }
    }

    pub fn reset(owner_id: impl Into<String>) -> Self {
        Event::Reset {
            owner_id: owner_id.into(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Upsert(_) => EventKind::Upsert,
            Event::Delete(_) => EventKind::Delete,
            Event::Reset { .. } => EventKind::Reset,
        }
    }

    pub fn owner_id(&self) -> &str {
        match self {
            Event::Upsert(record) | Event::Delete(record) => &record.owner_id,
            Event::Reset { owner_id } => owner_id,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Traits
// ═══════════════════════════════════════════════════════════════════════════

/// Read side of a per-owner versioned store
#[async_trait]
pub trait Store: Send + Sync {
    /// All versions stored under `(owner_id, id)`, newest first.
    ///
    /// A missing key (or owner) yields an empty list, not an error.
    async fn get(&self, owner_id: &str, id: &str) -> Result<Vec<Record>>;

    /// Newest version of every key of `owner_id`, in no particular order.
    ///
    /// Errors that prevent the scan from starting are returned here; the
    /// stream closes once every record was sent.
    async fn list(&self, owner_id: &str) -> Result<mpsc::Receiver<Record>>;
}

/// Direct writes
#[async_trait]
pub trait MutableStore: Store {
    /// Prepend each record as the newest version of its key.
    async fn add(&self, owner_id: &str, records: Vec<Record>) -> Result<()>;

    /// Remove every version of each record's key.
    async fn delete(&self, owner_id: &str, records: Vec<Record>) -> Result<()>;
}

/// A source of events that can be subscribed to exactly once
pub trait Watchable: Send + Sync {
    fn watch(&self) -> Result<mpsc::Receiver<Event>>;
}

/// Coalesced writes driven by an event stream
///
/// The returned stream carries one error per failed write and closes after
/// the input stream closed and the last partial batch was flushed.
pub trait Batchable: Send + Sync {
    fn batch(&self, events: mpsc::Receiver<Event>) -> mpsc::Receiver<StoreError>;
}

/// A store that can back the updater of a sync engine.
pub trait BatchableStore: Store + Batchable {}

impl<T: Store + Batchable> BatchableStore for T {}

/// Capacity of the stream returned by `Store::list`.
pub const LIST_CHANNEL_CAPACITY: usize = 1000;

/// Feed an already materialized scan through a bounded stream.
pub(crate) fn stream_records(records: Vec<Record>) -> mpsc::Receiver<Record> {
    let (tx, rx) = mpsc::channel(LIST_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        for record in records {
            if tx.send(record).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Collect an owner scan into a vector.
pub async fn collect_list<S: Store + ?Sized>(store: &S, owner_id: &str) -> Result<Vec<Record>> {
    let mut rx = store.list(owner_id).await?;
    let mut records = Vec::new();
    while let Some(record) = rx.recv().await {
        records.push(record);
    }
    Ok(records)
}
