//! Queryable databases
//!
//! - [`SyncDb`]: versioned store + full-text index, fed by a watch stream
//! - [`SimpleDb`]: filter/sort over any [`Store`] scan, no index

mod simple;
mod sync;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use scheduler_admin_store::{Record, Store};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::query::SearchQuery;

pub use simple::SimpleDb;
pub use sync::SyncDb;

/// A store that also answers filtered, sorted, paged searches
#[async_trait]
pub trait Db: Store {
    /// Match count (ignoring the page limit) and a stream of the page.
    async fn search(&self, query: &SearchQuery) -> Result<(usize, mpsc::Receiver<Record>)>;

    /// Run `query` and collect the page.
    async fn search_collect(&self, query: &SearchQuery) -> Result<SearchResult> {
        let (found, rx) = self.search(query).await?;
        Ok(SearchResult::collect(found, rx).await)
    }
}

/// Search response body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub found: usize,
    pub schedules: Vec<Record>,
}

impl SearchResult {
    pub async fn collect(found: usize, mut rx: mpsc::Receiver<Record>) -> Self {
        let mut schedules = Vec::new();
        while let Some(record) = rx.recv().await {
            schedules.push(record);
        }
        Self { found, schedules }
    }
}

/// On-disk layout of one database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbPaths {
    root: PathBuf,
}

impl DbPaths {
    pub const STORE_FILE: &'static str = "store.sqlite";
    pub const INDEX_DIR: &'static str = "index";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store_file(&self) -> PathBuf {
        self.root.join(Self::STORE_FILE)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join(Self::INDEX_DIR)
    }
}

/// A stream already holding `records`.
fn ready_stream(records: Vec<Record>) -> mpsc::Receiver<Record> {
    let (tx, rx) = mpsc::channel(records.len().max(1));
    for record in records {
        // capacity covers every record
        let _ = tx.try_send(record);
    }
    rx
}
