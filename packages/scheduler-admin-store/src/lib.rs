//! scheduler-admin-store: records, events and the stores behind the admin read path
//!
//! Every scheduler instance ("owner") emits upserts and deletes of its
//! scheduled items. This crate holds the shared vocabulary for those changes
//! and the two stores they land in.
//!
//! ## Stores
//!
//! - [`VersionedStore`]: SQLite, one row per version, newest first on read
//! - [`LiveCacheStore`]: in-memory current view, watchable as an event source
//!
//! Both implement [`Store`], [`MutableStore`] and [`Batchable`]. The batch
//! path coalesces events by count and by an idle timer into one write and
//! reports failures on a stream instead of returning them.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use scheduler_admin_store::{BatchOptions, Event, Record, Store, VersionedStore, Batchable};
//!
//! let store = VersionedStore::open("./.db/cold/store.sqlite", BatchOptions::default())?;
//! let (tx, rx) = tokio::sync::mpsc::channel(1000);
//! let mut errors = store.batch(rx);
//!
//! tx.send(Event::Upsert(Record::new("scheduler-1", "schedule-1").with_payload(b"v1".to_vec()))).await?;
//! drop(tx);
//! while let Some(err) = errors.recv().await {
//!     tracing::error!(error = %err, "write failed");
//! }
//!
//! let versions = store.get("scheduler-1", "schedule-1").await?;
//! ```

pub mod batch;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod retry;

pub use batch::BatchOptions;
pub use error::{ErrorKind, Result, StoreError};
pub use retry::RetryPolicy;

pub use domain::{
    collect_list, composite_key, Batchable, BatchableStore, Event, EventKind,
    MutableStore, Record, Store, Watchable,
};

pub use infrastructure::LiveCacheStore;

#[cfg(feature = "sqlite")]
pub use infrastructure::VersionedStore;
