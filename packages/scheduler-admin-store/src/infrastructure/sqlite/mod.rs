//! SQLite adapter: the durable versioned store
//!
//! Every version is a row keyed by `(owner_id, schedule_id, version)`. A new
//! version gets `MAX(version) + 1` of its key, so reading by descending
//! version yields newest first and nothing is ever overwritten.
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::batch::{spawn_batcher, BatchOptions, BatchWriter};
use crate::domain::{stream_records, Batchable, Event, MutableStore, Record, Store};
use crate::{Result, StoreError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const RECORD_COLUMNS: &str =
    "owner_id, schedule_id, epoch, timestamp, topic, target_topic, target_key, payload";

/// SQLite-backed versioned store
#[derive(Clone)]
pub struct VersionedStore {
    conn: Arc<Mutex<Connection>>,
    options: BatchOptions,
}

impl VersionedStore {
    /// Open (or create) the store file at `db_path`.
    pub fn open(db_path: impl AsRef<Path>, options: BatchOptions) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        info!(path = %db_path.display(), journal_mode = %mode, "versioned store opened");
        Self::with_connection(conn, options)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory(options: BatchOptions) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, options)
    }

    fn with_connection(conn: Connection, options: BatchOptions) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            options,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                owner_id TEXT NOT NULL,
                schedule_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                epoch INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                topic TEXT NOT NULL,
                target_topic TEXT NOT NULL,
                target_key TEXT NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (owner_id, schedule_id, version)
            )",
            [],
        )?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::database(format!("blocking task failed: {}", e)))?
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<Record> {
    Ok(Record {
        owner_id: row.get(0)?,
        id: row.get(1)?,
        epoch: row.get(2)?,
        timestamp: row.get(3)?,
        topic: row.get(4)?,
        target_topic: row.get(5)?,
        target_key: row.get(6)?,
        payload: row.get(7)?,
    })
}

fn insert_version(conn: &Connection, owner_id: &str, record: &Record) -> Result<()> {
    conn.execute(
        "INSERT INTO records (owner_id, schedule_id, version, epoch, timestamp, topic, target_topic, target_key, payload)
         SELECT ?1, ?2, COALESCE(MAX(version), 0) + 1, ?3, ?4, ?5, ?6, ?7, ?8
         FROM records WHERE owner_id = ?1 AND schedule_id = ?2",
        params![
            owner_id,
            &record.id,
            record.epoch,
            record.timestamp,
            &record.topic,
            &record.target_topic,
            &record.target_key,
            &record.payload,
        ],
    )?;
    Ok(())
}

fn delete_key(conn: &Connection, owner_id: &str, id: &str) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM records WHERE owner_id = ?1 AND schedule_id = ?2",
        params![owner_id, id],
    )?;
    Ok(removed)
}

fn apply_events(conn: &mut Connection, events: &[Event]) -> Result<()> {
    let tx = conn.transaction()?;
    for event in events {
        match event {
            Event::Upsert(record) => insert_version(&tx, &record.owner_id, record)?,
            Event::Delete(record) => {
                delete_key(&tx, &record.owner_id, &record.id)?;
            }
            Event::Reset { .. } => {}
        }
    }
    tx.commit()?;
    Ok(())
}

#[async_trait]
impl Store for VersionedStore {
    async fn get(&self, owner_id: &str, id: &str) -> Result<Vec<Record>> {
        let owner_id = owner_id.to_string();
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM records WHERE owner_id = ?1 AND schedule_id = ?2 ORDER BY version DESC",
                RECORD_COLUMNS
            ))?;
            let records = stmt
                .query_map(params![owner_id, id], record_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn list(&self, owner_id: &str) -> Result<mpsc::Receiver<Record>> {
        let owner_id = owner_id.to_string();
        let records = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM records r
                     WHERE r.owner_id = ?1
                       AND r.version = (
                           SELECT MAX(version) FROM records
                           WHERE owner_id = r.owner_id AND schedule_id = r.schedule_id
                       )",
                    RECORD_COLUMNS
                ))?;
                let records = stmt
                    .query_map(params![owner_id], record_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(records)
            })
            .await?;
        debug!(records = records.len(), "versioned store scan");
        Ok(stream_records(records))
    }
}

#[async_trait]
impl MutableStore for VersionedStore {
    async fn add(&self, owner_id: &str, records: Vec<Record>) -> Result<()> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for record in &records {
                insert_version(&tx, &owner_id, record)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, owner_id: &str, records: Vec<Record>) -> Result<()> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for record in &records {
                delete_key(&tx, &owner_id, &record.id)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl BatchWriter for VersionedStore {
    async fn write_batch(&self, events: &[Event]) -> Result<()> {
        let events = events.to_vec();
        self.with_conn(move |conn| apply_events(conn, &events)).await
    }
}

impl Batchable for VersionedStore {
    fn batch(&self, events: mpsc::Receiver<Event>) -> mpsc::Receiver<StoreError> {
        spawn_batcher("versioned", Arc::new(self.clone()), events, self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::collect_list;
    use tempfile::TempDir;

    fn record(id: &str, payload: &str) -> Record {
        Record::new("s1", id)
            .with_epoch(100)
            .with_timestamp(10)
            .with_payload(payload.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_versions_newest_first() {
        let store = VersionedStore::in_memory(BatchOptions::default()).unwrap();

        store.add("s1", vec![record("a", "v1")]).await.unwrap();
        store.add("s1", vec![record("a", "v2")]).await.unwrap();

        let versions = store.get("s1", "a").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].payload, b"v2");
        assert_eq!(versions[1].payload, b"v1");
        assert_eq!(versions[0].owner_id, "s1");
    }

    #[tokio::test]
    async fn test_delete_removes_every_version() {
        let store = VersionedStore::in_memory(BatchOptions::default()).unwrap();

        store
            .add("s1", vec![record("a", "v1"), record("a", "v2")])
            .await
            .unwrap();
        store.delete("s1", vec![Record::new("s1", "a")]).await.unwrap();

        assert!(store.get("s1", "a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_and_owner() {
        let store = VersionedStore::in_memory(BatchOptions::default()).unwrap();

        assert!(store.get("nobody", "a").await.unwrap().is_empty());
        assert!(collect_list(&store, "nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_returns_newest_per_key() {
        let store = VersionedStore::in_memory(BatchOptions::default()).unwrap();

        store
            .add("s1", vec![record("a", "v1"), record("a", "v2"), record("b", "v1")])
            .await
            .unwrap();
        store.add("s2", vec![record("c", "other")]).await.unwrap();

        let mut listed = collect_list(&store, "s1").await.unwrap();
        listed.sort_by(|l, r| l.id.cmp(&r.id));

        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "a");
        assert_eq!(listed[0].payload, b"v2");
        assert_eq!(listed[1].id, "b");
    }

    #[tokio::test]
    async fn test_batch_applies_events_in_order() {
        let store = VersionedStore::in_memory(BatchOptions::default()).unwrap();
        let (tx, rx) = mpsc::channel(16);
        let mut errors = store.batch(rx);

        tx.send(Event::Upsert(record("a", "v1"))).await.unwrap();
        tx.send(Event::Upsert(record("a", "v2"))).await.unwrap();
        tx.send(Event::Upsert(record("b", "v1"))).await.unwrap();
        tx.send(Event::Delete(Record::new("s1", "b"))).await.unwrap();
        tx.send(Event::reset("s1")).await.unwrap();
        drop(tx);

        assert!(errors.recv().await.is_none());

        let versions = store.get("s1", "a").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].payload, b"v2");
        assert!(store.get("s1", "b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reopen_file_store() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db").join("store.sqlite");

        {
            let store = VersionedStore::open(&path, BatchOptions::default()).unwrap();
            store.add("s1", vec![record("a", "v1")]).await.unwrap();
        }

        let store = VersionedStore::open(&path, BatchOptions::default()).unwrap();
        let versions = store.get("s1", "a").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].epoch, 100);
    }
}
