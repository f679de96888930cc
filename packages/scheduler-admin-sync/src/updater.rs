//! Updater: the single writer of the versioned store
//!
//! An adapter from typed upserts/deletes to the store's batch stream. The
//! store reports failed transactions on its error stream; the updater logs
//! them and moves on.

use std::sync::Arc;

use parking_lot::Mutex;
use scheduler_admin_store::{BatchableStore, Event, Record, StoreError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::UpdaterConfig;
use crate::error::{Result, SyncError};

pub struct Updater {
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Updater {
    pub fn start(store: Arc<dyn BatchableStore>, config: UpdaterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = tokio::spawn(run(store, rx, config.forward_capacity.max(1)));
        info!(queue_capacity = config.queue_capacity, "updater started");

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    async fn send(&self, event: Event) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| SyncError::closed("updater"))?;
        tx.send(event).await.map_err(|_| SyncError::closed("updater"))
    }

    /// Queue a new version of `record`.
    pub async fn upsert(&self, record: Record) -> Result<()> {
        self.send(Event::Upsert(record)).await
    }

    /// Queue removal of every version of `record`'s key.
    pub async fn delete(&self, record: Record) -> Result<()> {
        self.send(Event::Delete(record)).await
    }

    /// Stop accepting writes and wait until the store has applied (or
    /// reported) everything queued.
    pub async fn close(&self) -> Result<()> {
        drop(self.tx.lock().take());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }
}

fn log_store_error(err: StoreError) {
    error!(kind = %err.kind, error = %err, "store batch dropped");
}

async fn run(store: Arc<dyn BatchableStore>, mut rx: mpsc::Receiver<Event>, forward_capacity: usize) {
    let (batch_tx, batch_rx) = mpsc::channel(forward_capacity);
    let mut errors = store.batch(batch_rx);

    'events: loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };

                // keep draining errors while waiting for room, the batcher may
                // itself be blocked on a full error stream
                let permit = loop {
                    tokio::select! {
                        permit = batch_tx.reserve() => break permit,
                        Some(err) = errors.recv() => log_store_error(err),
                    }
                };
                match permit {
                    Ok(permit) => permit.send(event),
                    Err(_) => {
                        error!("store batch stream closed, updater stopping");
                        break 'events;
                    }
                }
            }
            Some(err) = errors.recv() => log_store_error(err),
        }
    }

    drop(batch_tx);
    while let Some(err) = errors.recv().await {
        log_store_error(err);
    }
    info!("updater stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_admin_store::{BatchOptions, LiveCacheStore, Store, VersionedStore};

    fn options() -> BatchOptions {
        BatchOptions {
            flush_interval_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_versions_and_delete_reach_store() {
        let store = Arc::new(VersionedStore::in_memory(options()).unwrap());
        let updater = Updater::start(store.clone(), UpdaterConfig::default());

        let v1 = Record::new("s1", "a").with_epoch(1).with_payload(b"v1".to_vec());
        let v2 = Record::new("s1", "a").with_epoch(2).with_payload(b"v2".to_vec());
        updater.upsert(v1).await.unwrap();
        updater.upsert(v2).await.unwrap();
        updater.upsert(Record::new("s1", "b").with_payload(b"b".to_vec())).await.unwrap();
        updater.delete(Record::new("s1", "b")).await.unwrap();
        updater.close().await.unwrap();

        let versions = store.get("s1", "a").await.unwrap();
        let epochs: Vec<i64> = versions.iter().map(|r| r.epoch).collect();
        assert_eq!(epochs, vec![2, 1]);
        assert!(store.get("s1", "b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_small_forward_channel_does_not_stall() {
        let store = Arc::new(LiveCacheStore::with_options(10_000, options()));
        let config = UpdaterConfig {
            queue_capacity: 4,
            forward_capacity: 1,
        };
        let updater = Updater::start(store.clone(), config);

        for i in 0..200 {
            let record = Record::new("s1", format!("id-{}", i)).with_payload(b"x".to_vec());
            updater.upsert(record).await.unwrap();
        }
        updater.close().await.unwrap();

        assert_eq!(store.len("s1"), 200);
    }

    #[tokio::test]
    async fn test_closed_updater_rejects_writes() {
        let store = Arc::new(LiveCacheStore::new());
        let updater = Updater::start(store, UpdaterConfig::default());
        updater.close().await.unwrap();

        let err = updater.upsert(Record::new("s1", "a")).await.unwrap_err();
        assert!(matches!(err, SyncError::Closed(_)));
    }
}
