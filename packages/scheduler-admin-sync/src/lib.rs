/*
 * Scheduler Admin Sync - read path of the scheduler admin
 *
 * Keeps queryable copies of every scheduler's schedules in line with the
 * broker topics they are produced to.
 *
 * Architecture:
 * - Topology source: one consumer per owner, reconciled against a resolver
 * - Sync engine: routes watch events to the updater and the indexer
 * - Versioned store (SQLite) and full-text index (Tantivy), each with a
 *   single batching writer
 * - Search: filter/sort/limit query, index-backed or scan-backed
 */

// Public modules
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod indexer;
pub mod query;
pub mod sort;
pub mod source;
pub mod tier;
pub mod translate;
pub mod updater;

// Re-exports
pub use config::{
    ConfigError, IndexerConfig, SearchConfig, SourceConfig, StoreConfig, SyncConfig, UpdaterConfig,
};
pub use db::{Db, DbPaths, SearchResult, SimpleDb, SyncDb};
pub use error::{ErrorCategory, Result, SyncError};
pub use index::{IndexDoc, IndexHit, IndexOp, IndexPage, ScheduleIndex};
pub use indexer::Indexer;
pub use query::{EpochRange, Filter, Limit, SearchQuery, SortBy, SortField, SortOrder};
pub use sort::{compare, sort_items, Sortable};
pub use source::{
    BrokerInfo, BrokerMessage, Bucket, ConsumerFactory, MemoryBroker, MessageConsumer, NamedOwner,
    OwnerInfo, ReconcileReport, Resolver, ResolverError, SchedulerInfo, StaticResolver,
    TopicSelector, TopologySource,
};
#[cfg(feature = "kafka")]
pub use source::KafkaConsumerFactory;
pub use tier::{Tier, TierDb};
pub use updater::Updater;
