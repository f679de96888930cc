//! Indexer: the single writer of the schedule index
//!
//! `upsert`/`delete` enqueue onto a bounded queue (blocking when it is full)
//! and return. A background loop drains the queue and commits a batch when
//! `batch_size` ops are pending or the flush timer fires, whichever comes
//! first. A commit that still fails after the retry policy gives up is
//! logged and the batch is dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use scheduler_admin_store::RetryPolicy;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::IndexerConfig;
use crate::error::{Result, SyncError};
use crate::index::{IndexDoc, IndexOp, ScheduleIndex};

enum Command {
    Op(IndexOp),
    /// Commit everything queued so far, then acknowledge
    Flush(oneshot::Sender<()>),
}

pub struct Indexer {
    tx: Mutex<Option<mpsc::Sender<Command>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Indexer {
    /// Start the indexing loop over `index`.
    pub fn start(index: Arc<ScheduleIndex>, config: IndexerConfig, retry: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = tokio::spawn(run(index, rx, config, retry));
        info!(
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval_ms,
            "indexer started"
        );

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Command>> {
        self.tx
            .lock()
            .clone()
            .ok_or_else(|| SyncError::closed("indexer"))
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.sender()?
            .send(command)
            .await
            .map_err(|_| SyncError::closed("indexer"))
    }

    /// Queue an upsert of `doc` under its composite key.
    pub async fn upsert(&self, doc: IndexDoc) -> Result<()> {
        self.send(Command::Op(IndexOp::Upsert(doc))).await
    }

    /// Queue a delete of `key`.
    pub async fn delete(&self, key: impl Into<String>) -> Result<()> {
        self.send(Command::Op(IndexOp::Delete(key.into()))).await
    }

    /// Wait until every op queued before this call has been committed (or dropped).
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Flush(done_tx)).await?;
        done_rx.await.map_err(|_| SyncError::closed("indexer"))
    }

    /// Stop accepting ops, drain the queue and wait for the loop to exit.
    pub async fn close(&self) -> Result<()> {
        drop(self.tx.lock().take());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }
}

async fn run(
    index: Arc<ScheduleIndex>,
    mut rx: mpsc::Receiver<Command>,
    config: IndexerConfig,
    retry: RetryPolicy,
) {
    let batch_size = config.batch_size.max(1);
    let mut ticker = tokio::time::interval(config.flush_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    let mut pending: Vec<IndexOp> = Vec::with_capacity(batch_size);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Op(op)) => {
                    pending.push(op);
                    if pending.len() >= batch_size {
                        commit(&index, &mut pending, &retry).await;
                        ticker.reset();
                    }
                }
                Some(Command::Flush(done)) => {
                    commit(&index, &mut pending, &retry).await;
                    let _ = done.send(());
                }
                None => {
                    commit(&index, &mut pending, &retry).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    commit(&index, &mut pending, &retry).await;
                }
            }
        }
    }

    info!("indexer stopped");
}

async fn commit(index: &Arc<ScheduleIndex>, pending: &mut Vec<IndexOp>, retry: &RetryPolicy) {
    if pending.is_empty() {
        return;
    }

    let batch = Arc::new(std::mem::take(pending));
    let result = retry
        .run("index commit", SyncError::is_transient, || {
            let index = Arc::clone(index);
            let batch = Arc::clone(&batch);
            async move { tokio::task::spawn_blocking(move || index.apply(&batch)).await? }
        })
        .await;

    match result {
        Ok(()) => debug!(batch = batch.len(), "index batch flushed"),
        Err(err) => error!(batch = batch.len(), error = %err, "index batch dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn doc(owner: &str, id: &str) -> IndexDoc {
        IndexDoc {
            owner_id: owner.to_string(),
            id: id.to_string(),
            epoch: 1,
            timestamp: 1,
        }
    }

    fn config(batch_size: usize, flush_interval_ms: u64) -> IndexerConfig {
        IndexerConfig {
            batch_size,
            flush_interval_ms,
            queue_capacity: 16,
        }
    }

    #[tokio::test]
    async fn test_flush_barrier_commits_pending() {
        let index = Arc::new(ScheduleIndex::in_memory().unwrap());
        let indexer = Indexer::start(index.clone(), config(100, 60_000), RetryPolicy::none());

        indexer.upsert(doc("s1", "a")).await.unwrap();
        indexer.upsert(doc("s1", "b")).await.unwrap();
        indexer.flush().await.unwrap();
        assert_eq!(index.doc_count(), 2);

        indexer.delete("s1|a").await.unwrap();
        indexer.flush().await.unwrap();
        assert_eq!(index.doc_count(), 1);

        indexer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timer_flushes_partial_batch() {
        let index = Arc::new(ScheduleIndex::in_memory().unwrap());
        let indexer = Indexer::start(index.clone(), config(100, 20), RetryPolicy::none());

        indexer.upsert(doc("s1", "a")).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while index.doc_count() == 0 {
            assert!(tokio::time::Instant::now() < deadline, "timer never flushed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        indexer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_queue() {
        let index = Arc::new(ScheduleIndex::in_memory().unwrap());
        let indexer = Indexer::start(index.clone(), config(1000, 60_000), RetryPolicy::none());

        for i in 0..10 {
            indexer.upsert(doc("s1", &format!("id-{}", i))).await.unwrap();
        }
        indexer.close().await.unwrap();

        assert_eq!(index.doc_count(), 10);
    }

    #[tokio::test]
    async fn test_closed_indexer_rejects_ops() {
        let index = Arc::new(ScheduleIndex::in_memory().unwrap());
        let indexer = Indexer::start(index, IndexerConfig::default(), RetryPolicy::none());
        indexer.close().await.unwrap();

        let err = indexer.upsert(doc("s1", "a")).await.unwrap_err();
        assert!(matches!(err, SyncError::Closed(_)));
        // closing twice is harmless
        indexer.close().await.unwrap();
    }
}
