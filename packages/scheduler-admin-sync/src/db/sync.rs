use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use scheduler_admin_store::domain::LIST_CHANNEL_CAPACITY;
use scheduler_admin_store::{
    collect_list, BatchableStore, Event, Record, Store, VersionedStore, Watchable,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Db, DbPaths};
use crate::config::{SearchConfig, SyncConfig};
use crate::error::Result;
use crate::index::{IndexDoc, ScheduleIndex};
use crate::indexer::Indexer;
use crate::query::SearchQuery;
use crate::updater::Updater;

/// A drain on close ends once the source stays silent this long.
const DRAIN_QUIET: Duration = Duration::from_millis(100);

/// Write side shared by the engine and its watch loop
struct Pipeline {
    store: Arc<dyn BatchableStore>,
    index: Arc<ScheduleIndex>,
    indexer: Indexer,
    updater: Updater,
}

impl Pipeline {
    async fn upsert(&self, record: Record) {
        let doc = IndexDoc::from(&record);
        let key = record.composite_key();
        if let Err(err) = self.updater.upsert(record).await {
            error!(key = %key, error = %err, "store upsert failed");
        }
        if let Err(err) = self.indexer.upsert(doc).await {
            error!(key = %key, error = %err, "index upsert failed");
        }
    }

    async fn delete(&self, record: Record) {
        let key = record.composite_key();
        if let Err(err) = self.updater.delete(record).await {
            error!(key = %key, error = %err, "store delete failed");
        }
        if let Err(err) = self.indexer.delete(key.clone()).await {
            error!(key = %key, error = %err, "index delete failed");
        }
    }

    /// Delete everything known about `owner_id`, through the normal write path.
    async fn reset(&self, owner_id: &str) -> Result<usize> {
        // make every write routed so far visible to the scan below
        self.indexer.flush().await?;

        let index = Arc::clone(&self.index);
        let owner = owner_id.to_string();
        let hits = tokio::task::spawn_blocking(move || index.owner_hits(&owner)).await??;

        let mut ids: BTreeSet<String> = hits.into_iter().map(|hit| hit.id).collect();
        for record in collect_list(self.store.as_ref(), owner_id).await? {
            ids.insert(record.id);
        }

        let deleted = ids.len();
        for id in ids {
            self.delete(Record::new(owner_id, id)).await;
        }
        info!(owner = %owner_id, deleted, "owner reset");
        Ok(deleted)
    }

    async fn route(&self, event: Event) {
        debug!(kind = %event.kind(), owner = %event.owner_id(), "routing event");
        match event {
            Event::Upsert(record) => self.upsert(record).await,
            Event::Delete(record) => self.delete(record).await,
            Event::Reset { owner_id } => {
                if let Err(err) = self.reset(&owner_id).await {
                    error!(owner = %owner_id, error = %err, "owner reset failed");
                }
            }
        }
    }
}

/// The indexed database
///
/// Subscribes once to a watchable source and routes every event to the
/// updater (versioned store) and the indexer (full-text index), in that
/// order. The two are not written transactionally; both converge within a
/// flush interval.
///
/// Searches run against the index and hydrate each hit from the store, so a
/// hit whose record is missing is skipped and `found` may exceed the number
/// of streamed records.
pub struct SyncDb {
    pipeline: Arc<Pipeline>,
    search: SearchConfig,
    cancel: CancellationToken,
    watch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncDb {
    /// Open the store and index under `paths` and start syncing from `source`.
    pub fn open(paths: &DbPaths, source: &dyn Watchable, config: &SyncConfig) -> Result<Self> {
        let store = VersionedStore::open(paths.store_file(), config.batch_options())?;
        Self::with_store(Arc::new(store), source, &paths.index_dir(), config)
    }

    /// Start syncing `source` into `store` and an index at `index_dir`.
    pub fn with_store(
        store: Arc<dyn BatchableStore>,
        source: &dyn Watchable,
        index_dir: &Path,
        config: &SyncConfig,
    ) -> Result<Self> {
        let index = ScheduleIndex::open(index_dir)?;
        Self::start(store, source, index, config)
    }

    /// Start syncing with an already opened index.
    ///
    /// Fails on an invalid `config` before subscribing to `source`.
    pub fn start(
        store: Arc<dyn BatchableStore>,
        source: &dyn Watchable,
        index: ScheduleIndex,
        config: &SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let events = source.watch()?;

        let index = Arc::new(index);
        let pipeline = Arc::new(Pipeline {
            indexer: Indexer::start(Arc::clone(&index), config.indexer, config.retry),
            updater: Updater::start(Arc::clone(&store), config.updater),
            store,
            index,
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_loop(
            Arc::clone(&pipeline),
            events,
            cancel.clone(),
            config.source.shutdown_timeout(),
        ));

        Ok(Self {
            pipeline,
            search: config.search,
            cancel,
            watch_handle: Mutex::new(Some(handle)),
        })
    }

    pub async fn upsert(&self, record: Record) {
        self.pipeline.upsert(record).await
    }

    pub async fn delete(&self, record: Record) {
        self.pipeline.delete(record).await
    }

    /// Purge `owner_id` from both derived stores, returning how many keys
    /// were deleted.
    pub async fn reset(&self, owner_id: &str) -> Result<usize> {
        self.pipeline.reset(owner_id).await
    }

    /// Wait until every routed index write is searchable.
    pub async fn flush_index(&self) -> Result<()> {
        self.pipeline.indexer.flush().await
    }

    /// Stop watching, then drain and stop the updater and the indexer.
    ///
    /// Events the source already handed over are routed before the watch
    /// loop exits, until the source goes quiet or the shutdown timeout
    /// passes. No write reaches either store once this returns.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let handle = self.watch_handle.lock().take();
        if let Some(handle) = handle {
            handle.await?;
        }
        self.pipeline.updater.close().await?;
        self.pipeline.indexer.close().await?;
        info!("sync db closed");
        Ok(())
    }
}

impl Drop for SyncDb {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn watch_loop(
    pipeline: Arc<Pipeline>,
    mut events: mpsc::Receiver<Event>,
    cancel: CancellationToken,
    drain_timeout: Duration,
) {
    info!("watch loop started");
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                drain(&pipeline, &mut events, drain_timeout).await;
                break;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    info!("watch stream closed");
                    break;
                }
            },
        };
        pipeline.route(event).await;
    }
    info!("watch loop stopped");
}

/// Route the events still on their way from the source.
async fn drain(pipeline: &Pipeline, events: &mut mpsc::Receiver<Event>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    let mut drained = 0usize;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            warn!(drained, "watch drain cut by the shutdown timeout");
            return;
        }
        match tokio::time::timeout(DRAIN_QUIET.min(left), events.recv()).await {
            Ok(Some(event)) => {
                pipeline.route(event).await;
                drained += 1;
            }
            Ok(None) | Err(_) => break,
        }
    }
    debug!(drained, "watch stream drained");
}

#[async_trait]
impl Store for SyncDb {
    async fn get(&self, owner_id: &str, id: &str) -> scheduler_admin_store::Result<Vec<Record>> {
        self.pipeline.store.get(owner_id, id).await
    }

    async fn list(&self, owner_id: &str) -> scheduler_admin_store::Result<mpsc::Receiver<Record>> {
        self.pipeline.store.list(owner_id).await
    }
}

#[async_trait]
impl Db for SyncDb {
    async fn search(&self, query: &SearchQuery) -> Result<(usize, mpsc::Receiver<Record>)> {
        let limit = query
            .limit
            .resolve(self.search.default_page_size, self.search.max_page_size);

        let index = Arc::clone(&self.pipeline.index);
        let filter = query.filter.clone();
        let sort_by = query.sort_by;
        let page =
            tokio::task::spawn_blocking(move || index.search(&filter, sort_by, limit)).await??;

        let (tx, rx) = mpsc::channel(page.hits.len().clamp(1, LIST_CHANNEL_CAPACITY));
        let store = Arc::clone(&self.pipeline.store);
        tokio::spawn(async move {
            for hit in page.hits {
                match store.get(&hit.owner_id, &hit.id).await {
                    Ok(versions) => match versions.into_iter().next() {
                        Some(record) => {
                            if tx.send(record).await.is_err() {
                                debug!("search stream dropped by caller");
                                return;
                            }
                        }
                        None => warn!(key = %hit.key, "indexed record missing from store, skipped"),
                    },
                    Err(err) => warn!(key = %hit.key, error = %err, "hydration failed, skipped"),
                }
            }
        });

        Ok((page.total, rx))
    }
}
