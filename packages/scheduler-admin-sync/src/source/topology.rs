//! Topology-aware stream source
//!
//! # Lifecycle
//!
//! ```text
//! Resolver ──(every recheck_interval)──> reconcile ──> per-owner consumers
//!                                            │               │
//!                                         Reset            messages
//!                                            └──> work queue <┘
//!                                                     │
//!                                                translation
//!                                                     │
//!                                               watch stream (Event)
//! ```
//!
//! Reconciliation per owner:
//! - new owner: start a consumer
//! - same coordinates and topics: nothing
//! - changed: stop and await the old consumer, emit Reset, start a new one
//! - gone (only with `remove_stale_owners`, only after a complete
//!   resolution): stop the consumer and emit Reset
//!
//! Every consumer runs under a child of the source's cancellation token, so
//! `close()` stops all of them, whatever state reconciliation was left in.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use scheduler_admin_store::{Event, StoreError, Watchable};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::{BrokerMessage, ConsumerFactory, MessageConsumer};
use super::bucket::{Bucket, TopicSelector};
use super::resolver::{Resolver, ResolverError};
use crate::config::SourceConfig;
use crate::error::{ErrorCategory, Result, SyncError};

/// Item of the shared work queue
#[derive(Debug)]
enum SourceItem {
    Message { owner_id: String, message: BrokerMessage },
    Reset(String),
}

struct RunningConsumer {
    bucket: Bucket,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Outcome of one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub reconfigured: Vec<String>,
    pub stopped: Vec<String>,
    /// The resolver only answered for part of the owners
    pub degraded: bool,
}

impl ReconcileReport {
    pub fn has_changes(&self) -> bool {
        !(self.started.is_empty() && self.reconfigured.is_empty() && self.stopped.is_empty())
    }
}

struct Shared {
    resolver: Arc<dyn Resolver>,
    factory: Arc<dyn ConsumerFactory>,
    selector: TopicSelector,
    config: SourceConfig,
    consumers: DashMap<String, RunningConsumer>,
    work_tx: mpsc::Sender<SourceItem>,
    cancel: CancellationToken,
    reconcile_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    async fn reconcile(&self) -> Result<ReconcileReport> {
        let _guard = self.reconcile_lock.lock().await;
        if self.cancel.is_cancelled() {
            return Err(SyncError::closed("topology source"));
        }

        let (owners, degraded) = match self.resolver.list().await {
            Ok(owners) => (owners, false),
            Err(ResolverError::Partial { resolved, failed }) => {
                warn!(failed = ?failed, resolved = resolved.len(), "partial topology resolution, running degraded");
                (resolved, true)
            }
            Err(err) => return Err(err.into()),
        };

        // every owner must carry broker info before anything changes
        let buckets = owners
            .iter()
            .map(|owner| Bucket::from_owner(owner.as_ref(), self.selector))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut report = ReconcileReport {
            degraded,
            ..Default::default()
        };
        let mut seen = HashSet::new();

        for bucket in buckets {
            let owner = bucket.owner_id.clone();
            if !seen.insert(owner.clone()) {
                warn!(owner = %owner, "owner resolved twice, keeping the first");
                continue;
            }

            let current = self.consumers.get(&owner).map(|running| running.bucket.clone());
            match current {
                None => {
                    if self.start_consumer(bucket) {
                        report.started.push(owner);
                    }
                }
                Some(current) if !current.differs_from(&bucket) => {}
                Some(current) => {
                    info!(
                        owner = %owner,
                        from = %current.bootstrap_servers,
                        to = %bucket.bootstrap_servers,
                        topics = ?bucket.topics,
                        "owner topology changed, reconfiguring consumer"
                    );
                    self.stop_consumer(&owner).await;
                    self.send_work(SourceItem::Reset(owner.clone())).await?;
                    self.start_consumer(bucket);
                    report.reconfigured.push(owner);
                }
            }
        }

        if self.config.remove_stale_owners && !degraded {
            let stale: Vec<String> = self
                .consumers
                .iter()
                .map(|entry| entry.key().clone())
                .filter(|owner| !seen.contains(owner))
                .collect();
            for owner in stale {
                info!(owner = %owner, "owner no longer resolved, stopping consumer");
                self.stop_consumer(&owner).await;
                self.send_work(SourceItem::Reset(owner.clone())).await?;
                report.stopped.push(owner);
            }
        }

        Ok(report)
    }

    /// Start consuming `bucket`; a consumer that cannot be created is retried
    /// on the next recheck.
    fn start_consumer(&self, bucket: Bucket) -> bool {
        let consumer = match self.factory.create(&bucket, &self.config.group_id) {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(owner = %bucket.owner_id, error = %err, "cannot create consumer");
                return false;
            }
        };

        let token = self.cancel.child_token();
        let handle = tokio::spawn(consume(
            bucket.clone(),
            consumer,
            self.work_tx.clone(),
            token.clone(),
            self.config.clone(),
        ));
        self.consumers.insert(
            bucket.owner_id.clone(),
            RunningConsumer {
                bucket,
                token,
                handle,
            },
        );
        true
    }

    async fn stop_consumer(&self, owner: &str) {
        if let Some((_, running)) = self.consumers.remove(owner) {
            running.token.cancel();
            if let Err(err) = running.handle.await {
                warn!(owner = %owner, error = %err, "consumer task failed");
            }
        }
    }

    async fn send_work(&self, item: SourceItem) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::closed("topology source")),
            sent = self.work_tx.send(item) => sent.map_err(|_| SyncError::closed("topology source")),
        }
    }
}

/// Watchable multi-owner source driven by a [`Resolver`]
pub struct TopologySource {
    shared: Arc<Shared>,
    watch_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TopologySource {
    /// Resolve the topology, start the owners' consumers and the recheck loop.
    ///
    /// Fails on an invalid `config` or when an owner carries no broker info.
    /// Other resolution errors are logged and retried on the next recheck.
    pub async fn start(
        resolver: Arc<dyn Resolver>,
        factory: Arc<dyn ConsumerFactory>,
        selector: TopicSelector,
        config: SourceConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (work_tx, work_rx) = mpsc::channel(config.queue_capacity);
        let (watch_tx, watch_rx) = mpsc::channel(config.watch_capacity);

        let shared = Arc::new(Shared {
            resolver,
            factory,
            selector,
            config,
            consumers: DashMap::new(),
            work_tx,
            cancel: CancellationToken::new(),
            reconcile_lock: tokio::sync::Mutex::new(()),
        });

        match shared.reconcile().await {
            Ok(report) => info!(
                owners = report.started.len(),
                degraded = report.degraded,
                selector = ?selector,
                "topology source started"
            ),
            Err(err) if err.category() == ErrorCategory::Permanent => {
                shared.cancel.cancel();
                return Err(err);
            }
            Err(err) => warn!(error = %err, "initial topology resolution failed, retrying on recheck"),
        }

        let translator = tokio::spawn(translate(work_rx, watch_tx, shared.cancel.clone()));
        let recheck = tokio::spawn(recheck(Arc::clone(&shared)));

        Ok(Self {
            shared,
            watch_rx: Mutex::new(Some(watch_rx)),
            tasks: Mutex::new(vec![translator, recheck]),
        })
    }

    /// Re-resolve and reconcile now, without waiting for the recheck timer.
    pub async fn refresh(&self) -> Result<ReconcileReport> {
        self.shared.reconcile().await
    }

    /// Buckets currently consumed, ordered by owner.
    pub fn owners(&self) -> Vec<Bucket> {
        let mut buckets: Vec<Bucket> = self
            .shared
            .consumers
            .iter()
            .map(|entry| entry.value().bucket.clone())
            .collect();
        buckets.sort_by(|a, b| a.owner_id.cmp(&b.owner_id));
        buckets
    }

    /// Stop the recheck loop and every consumer and wait for them to exit,
    /// bounded by the shutdown timeout.
    pub async fn close(&self) -> Result<()> {
        self.shared.cancel.cancel();

        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        {
            // a reconciliation in flight finishes before the registry is drained
            let _guard = self.shared.reconcile_lock.lock().await;
            let owners: Vec<String> = self
                .shared
                .consumers
                .iter()
                .map(|entry| entry.key().clone())
                .collect();
            for owner in owners {
                if let Some((_, running)) = self.shared.consumers.remove(&owner) {
                    handles.push(running.handle);
                }
            }
        }

        let timeout = self.shared.config.shutdown_timeout();
        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(results) => {
                for err in results.into_iter().filter_map(|r| r.err()) {
                    warn!(error = %err, "topology task failed");
                }
                info!("topology source closed");
                Ok(())
            }
            Err(_) => Err(SyncError::Timeout(format!(
                "topology source did not stop within {:?}",
                timeout
            ))),
        }
    }
}

impl Drop for TopologySource {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Watchable for TopologySource {
    fn watch(&self) -> scheduler_admin_store::Result<mpsc::Receiver<Event>> {
        self.watch_rx
            .lock()
            .take()
            .ok_or_else(StoreError::already_watched)
    }
}

async fn recheck(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.recheck_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick is the initial resolution, already done
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => match shared.reconcile().await {
                Ok(report) if report.has_changes() => info!(
                    started = ?report.started,
                    reconfigured = ?report.reconfigured,
                    stopped = ?report.stopped,
                    "topology updated"
                ),
                Ok(_) => debug!("topology unchanged"),
                Err(err) => error!(error = %err, "topology recheck failed"),
            },
        }
    }
    debug!("recheck loop stopped");
}

/// Turn queued items into watch events. Shape errors drop the message.
async fn translate(
    mut work: mpsc::Receiver<SourceItem>,
    watch: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = work.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let event = match item {
            SourceItem::Message { owner_id, message } => match message.into_record(&owner_id) {
                Ok(record) => Event::from_record(record),
                Err(err) => {
                    error!(owner = %owner_id, error = %err, "malformed message dropped");
                    continue;
                }
            },
            SourceItem::Reset(owner_id) => Event::reset(owner_id),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = watch.send(event) => {
                if sent.is_err() {
                    debug!("watch stream dropped, stopping translation");
                    break;
                }
            }
        }
    }
    debug!("translation loop stopped");
}

/// Per-owner consumer loop.
async fn consume(
    bucket: Bucket,
    mut consumer: Box<dyn MessageConsumer>,
    work: mpsc::Sender<SourceItem>,
    token: CancellationToken,
    config: SourceConfig,
) {
    let owner = bucket.owner_id.as_str();
    let poll_timeout = config.poll_timeout();

    // subscribe until it works or we are told to stop
    loop {
        match consumer.subscribe(&bucket.topics).await {
            Ok(()) => break,
            Err(err) => {
                warn!(owner = %owner, error = %err, "subscribe failed, retrying");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(poll_timeout) => {}
                }
            }
        }
    }
    info!(
        owner = %owner,
        bootstrap_servers = %bucket.bootstrap_servers,
        topics = ?bucket.topics,
        "consumer started"
    );

    loop {
        let polled = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            polled = consumer.poll(poll_timeout) => polled,
        };

        match polled {
            Ok(Some(message)) => {
                let item = SourceItem::Message {
                    owner_id: owner.to_string(),
                    message,
                };
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    sent = work.send(item) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(owner = %owner, error = %err, "poll failed");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(poll_timeout) => {}
                }
            }
        }
    }

    if let Err(err) = consumer.close().await {
        warn!(owner = %owner, error = %err, "consumer close failed");
    }
    info!(owner = %owner, "consumer stopped");
}
