//! In-memory live cache store
//!
//! Holds the current view of every owner behind one reader/writer lock and
//! doubles as a watchable source: each write is announced as an [`Event`].
//! Nothing is announced until `watch()` is called; from then on events go to
//! an unbounded channel while the write lock is held and are drained
//! asynchronously into the bounded stream handed out by `watch()`, so a slow
//! watcher never blocks a writer.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::batch::{spawn_batcher, BatchOptions, BatchWriter};
use crate::domain::{
    stream_records, Batchable, Event, MutableStore, Record, Store, Watchable,
};
use crate::{Result, StoreError};

/// Default capacity of the watch stream.
pub const DEFAULT_WATCH_CAPACITY: usize = 1000;

type Versions = HashMap<String, Vec<Record>>;

enum WatchState {
    /// No watcher yet, writes are not announced
    Idle,
    Watched(mpsc::UnboundedSender<Event>),
    /// Data-only store, `watch()` fails
    Disabled,
}

struct Inner {
    data: RwLock<HashMap<String, Versions>>,
    watch: Mutex<WatchState>,
    watch_capacity: usize,
    options: BatchOptions,
}

/// Watchable in-memory store
#[derive(Clone)]
pub struct LiveCacheStore {
    inner: Arc<Inner>,
}

impl Default for LiveCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveCacheStore {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_WATCH_CAPACITY, BatchOptions::default())
    }

    pub fn with_options(watch_capacity: usize, options: BatchOptions) -> Self {
        Self::with_state(WatchState::Idle, watch_capacity, options)
    }

    /// A store used only for its data: writes announce nothing and `watch()`
    /// fails.
    pub fn unwatched(options: BatchOptions) -> Self {
        Self::with_state(WatchState::Disabled, DEFAULT_WATCH_CAPACITY, options)
    }

    fn with_state(state: WatchState, watch_capacity: usize, options: BatchOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: RwLock::new(HashMap::new()),
                watch: Mutex::new(state),
                watch_capacity: watch_capacity.max(1),
                options,
            }),
        }
    }

    /// Whether writes are currently announced to a watcher.
    pub fn is_watched(&self) -> bool {
        matches!(*self.inner.watch.lock(), WatchState::Watched(_))
    }

    /// Drop everything known about `owner_id` and announce a Reset.
    pub fn reset(&self, owner_id: &str) {
        let mut data = self.inner.data.write();
        data.remove(owner_id);
        self.emit(Event::reset(owner_id));
        info!(owner = %owner_id, "live cache reset");
    }

    /// Number of keys currently held for `owner_id`.
    pub fn len(&self, owner_id: &str) -> usize {
        self.inner
            .data
            .read()
            .get(owner_id)
            .map(|versions| versions.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, owner_id: &str) -> bool {
        self.len(owner_id) == 0
    }

    fn emit(&self, event: Event) {
        let watch = self.inner.watch.lock();
        let WatchState::Watched(events_tx) = &*watch else {
            return;
        };
        // only fails once the receiver is gone, i.e. the watcher shut down
        if events_tx.send(event).is_err() {
            debug!("live cache event dropped, watcher gone");
        }
    }

    fn insert_locked(data: &mut HashMap<String, Versions>, owner_id: &str, record: Record) {
        data.entry(owner_id.to_string())
            .or_default()
            .entry(record.id.clone())
            .or_default()
            .insert(0, record);
    }

    fn remove_locked(data: &mut HashMap<String, Versions>, owner_id: &str, id: &str) {
        if let Some(versions) = data.get_mut(owner_id) {
            versions.remove(id);
            if versions.is_empty() {
                data.remove(owner_id);
            }
        }
    }

    fn apply(&self, events: &[Event]) {
        let mut data = self.inner.data.write();
        for event in events {
            match event {
                Event::Upsert(record) => {
                    Self::insert_locked(&mut data, &record.owner_id, record.clone());
                }
                Event::Delete(record) => {
                    Self::remove_locked(&mut data, &record.owner_id, &record.id);
                }
                Event::Reset { owner_id } => {
                    data.remove(owner_id);
                }
            }
            self.emit(event.clone());
        }
    }
}

#[async_trait]
impl Store for LiveCacheStore {
    async fn get(&self, owner_id: &str, id: &str) -> Result<Vec<Record>> {
        let data = self.inner.data.read();
        Ok(data
            .get(owner_id)
            .and_then(|versions| versions.get(id))
            .cloned()
            .unwrap_or_default())
    }

    async fn list(&self, owner_id: &str) -> Result<mpsc::Receiver<Record>> {
        let latest: Vec<Record> = {
            let data = self.inner.data.read();
            data.get(owner_id)
                .map(|versions| {
                    versions
                        .values()
                        .filter_map(|list| list.first().cloned())
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(stream_records(latest))
    }
}

#[async_trait]
impl MutableStore for LiveCacheStore {
    async fn add(&self, owner_id: &str, records: Vec<Record>) -> Result<()> {
        let mut data = self.inner.data.write();
        for mut record in records {
            record.owner_id = owner_id.to_string();
            Self::insert_locked(&mut data, owner_id, record.clone());
            self.emit(Event::Upsert(record));
        }
        Ok(())
    }

    async fn delete(&self, owner_id: &str, records: Vec<Record>) -> Result<()> {
        let mut data = self.inner.data.write();
        for mut record in records {
            record.owner_id = owner_id.to_string();
            Self::remove_locked(&mut data, owner_id, &record.id);
            self.emit(Event::Delete(record));
        }
        Ok(())
    }
}

impl Watchable for LiveCacheStore {
    fn watch(&self) -> Result<mpsc::Receiver<Event>> {
        let mut source = {
            let mut watch = self.inner.watch.lock();
            if !matches!(*watch, WatchState::Idle) {
                return Err(StoreError::already_watched());
            }
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            *watch = WatchState::Watched(events_tx);
            events_rx
        };

        let (tx, rx) = mpsc::channel(self.inner.watch_capacity);
        tokio::spawn(async move {
            while let Some(event) = source.recv().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!("live cache watch forwarder exited");
        });
        Ok(rx)
    }
}

#[async_trait]
impl BatchWriter for LiveCacheStore {
    async fn write_batch(&self, events: &[Event]) -> Result<()> {
        self.apply(events);
        Ok(())
    }
}

impl Batchable for LiveCacheStore {
    fn batch(&self, events: mpsc::Receiver<Event>) -> mpsc::Receiver<StoreError> {
        spawn_batcher("live", Arc::new(self.clone()), events, self.inner.options)
    }
}
