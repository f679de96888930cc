//! Coalescing batch writer shared by the store backends
//!
//! Events are buffered until either `batch_size` of them arrived or
//! `flush_interval` elapsed since the last flush, then applied as one unit.
//! Closing the input flushes what is pending and closes the error stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::domain::Event;
use crate::retry::RetryPolicy;
use crate::{Result, StoreError};

/// Tuning of a store's batch write path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Events per transaction
    pub batch_size: usize,
    /// Idle flush timer, in milliseconds
    pub flush_interval_ms: u64,
    /// Capacity of the error stream
    pub error_capacity: usize,
    /// Retry of transient transaction failures
    pub retry: RetryPolicy,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval_ms: 500,
            error_capacity: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

impl BatchOptions {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// Applies one coalesced batch atomically.
#[async_trait]
pub(crate) trait BatchWriter: Send + Sync + 'static {
    async fn write_batch(&self, events: &[Event]) -> Result<()>;
}

/// Spawn the batching loop over `events` and return its error stream.
pub(crate) fn spawn_batcher<W: BatchWriter>(
    name: &'static str,
    writer: Arc<W>,
    mut events: mpsc::Receiver<Event>,
    options: BatchOptions,
) -> mpsc::Receiver<StoreError> {
    let (err_tx, err_rx) = mpsc::channel(options.error_capacity.max(1));
    let batch_size = options.batch_size.max(1);

    tokio::spawn(async move {
        info!(store = name, batch_size, "batch writer started");

        let mut pending: Vec<Event> = Vec::with_capacity(batch_size);
        let mut written = 0usize;
        let mut ticker = tokio::time::interval(options.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately on the first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(Event::Reset { owner_id }) => {
                        debug!(store = name, owner = %owner_id, "reset ignored by batch writer");
                    }
                    Some(event) => {
                        pending.push(event);
                        if pending.len() >= batch_size {
                            written += flush(name, &*writer, &mut pending, &options, &err_tx).await;
                            ticker.reset();
                        }
                    }
                    None => {
                        written += flush(name, &*writer, &mut pending, &options, &err_tx).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        written += flush(name, &*writer, &mut pending, &options, &err_tx).await;
                    }
                }
            }
        }

        info!(store = name, written, "batch writer exited");
    });

    err_rx
}

/// Apply and clear `pending`. Returns the number of events written.
async fn flush<W: BatchWriter>(
    name: &'static str,
    writer: &W,
    pending: &mut Vec<Event>,
    options: &BatchOptions,
    errors: &mpsc::Sender<StoreError>,
) -> usize {
    if pending.is_empty() {
        return 0;
    }
    let batch = std::mem::take(pending);
    let size = batch.len();

    let result = options
        .retry
        .run(name, StoreError::is_transient, || writer.write_batch(&batch))
        .await;

    match result {
        Ok(()) => {
            debug!(store = name, batch = size, "batch committed");
            size
        }
        Err(err) => {
            error!(store = name, batch = size, error = %err, "batch dropped");
            // receiver gone means nobody is interested in failures any more
            let _ = errors.send(err).await;
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Record;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingWriter {
        batches: Mutex<Vec<usize>>,
        fail: bool,
    }

    #[async_trait]
    impl BatchWriter for RecordingWriter {
        async fn write_batch(&self, events: &[Event]) -> Result<()> {
            if self.fail {
                return Err(StoreError::database("constraint failed"));
            }
            self.batches.lock().push(events.len());
            Ok(())
        }
    }

    fn upsert(id: &str) -> Event {
        Event::Upsert(Record::new("s1", id).with_payload(b"x".to_vec()))
    }

    #[tokio::test]
    async fn test_flushes_on_batch_size_and_close() {
        let writer = Arc::new(RecordingWriter::default());
        let (tx, rx) = mpsc::channel(16);
        let options = BatchOptions {
            batch_size: 2,
            flush_interval_ms: 60_000,
            ..Default::default()
        };
        let mut errors = spawn_batcher("test", writer.clone(), rx, options);

        for id in ["a", "b", "c"] {
            tx.send(upsert(id)).await.unwrap();
        }
        drop(tx);

        // error stream closes once the final partial batch is flushed
        assert!(errors.recv().await.is_none());
        assert_eq!(*writer.batches.lock(), vec![2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_timer() {
        let writer = Arc::new(RecordingWriter::default());
        let (tx, rx) = mpsc::channel(16);
        let options = BatchOptions {
            batch_size: 100,
            flush_interval_ms: 500,
            ..Default::default()
        };
        let _errors = spawn_batcher("test", writer.clone(), rx, options);

        tx.send(upsert("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(*writer.batches.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_reset_is_skipped() {
        let writer = Arc::new(RecordingWriter::default());
        let (tx, rx) = mpsc::channel(16);
        let mut errors = spawn_batcher("test", writer.clone(), rx, BatchOptions::default());

        tx.send(Event::reset("s1")).await.unwrap();
        drop(tx);

        assert!(errors.recv().await.is_none());
        assert!(writer.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_reported_on_error_stream() {
        let writer = Arc::new(RecordingWriter {
            fail: true,
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(16);
        let mut errors = spawn_batcher("test", writer, rx, BatchOptions::default());

        tx.send(upsert("a")).await.unwrap();
        drop(tx);

        let err = errors.recv().await.expect("one error");
        assert_eq!(err.kind, crate::ErrorKind::Database);
        assert!(errors.recv().await.is_none());
    }
}
