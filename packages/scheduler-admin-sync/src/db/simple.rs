use std::sync::Arc;

use async_trait::async_trait;
use scheduler_admin_store::{collect_list, Record, Store};
use tokio::sync::mpsc;

use super::{ready_stream, Db};
use crate::config::SearchConfig;
use crate::error::Result;
use crate::query::{Filter, SearchQuery};
use crate::sort::sort_items;

/// Search over a plain [`Store`] scan
///
/// Used for the live view, where the store is small and already current.
/// Only searches scoped to one owner return anything.
pub struct SimpleDb<S: ?Sized> {
    store: Arc<S>,
    search: SearchConfig,
}

impl<S: Store + ?Sized> SimpleDb<S> {
    pub fn new(store: Arc<S>, search: SearchConfig) -> Self {
        Self { store, search }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

fn matches(filter: &Filter, record: &Record) -> bool {
    let id = filter.schedule_id.trim();
    if !id.is_empty() && !record.id.trim().contains(id) {
        return false;
    }

    let range = filter.epoch;
    if let Some(from) = range.lower() {
        if record.epoch < from {
            return false;
        }
    }
    // an inverted range only bounds from below
    if let Some(to) = range.upper() {
        if range.from <= to && record.epoch > to {
            return false;
        }
    }
    true
}

#[async_trait]
impl<S: Store + ?Sized> Store for SimpleDb<S> {
    async fn get(&self, owner_id: &str, id: &str) -> scheduler_admin_store::Result<Vec<Record>> {
        self.store.get(owner_id, id).await
    }

    async fn list(&self, owner_id: &str) -> scheduler_admin_store::Result<mpsc::Receiver<Record>> {
        self.store.list(owner_id).await
    }
}

#[async_trait]
impl<S: Store + ?Sized> Db for SimpleDb<S> {
    async fn search(&self, query: &SearchQuery) -> Result<(usize, mpsc::Receiver<Record>)> {
        let owner = query.filter.owner.trim();
        if owner.is_empty() {
            return Ok((0, ready_stream(Vec::new())));
        }

        let mut matched: Vec<Record> = collect_list(self.store.as_ref(), owner)
            .await?
            .into_iter()
            .filter(|record| matches(&query.filter, record))
            .collect();
        let found = matched.len();

        sort_items(&mut matched, query.sort_by);
        if let Some(limit) = query
            .limit
            .resolve(self.search.default_page_size, self.search.max_page_size)
        {
            matched.truncate(limit);
        }

        Ok((found, ready_stream(matched)))
    }
}
