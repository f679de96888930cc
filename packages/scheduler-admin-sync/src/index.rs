//! Tantivy full-text index over the record projection
//!
//! # Schema
//!
//! 1. `key` - composite key `owner|id` (raw, stored) - document identity
//! 2. `scheduler` - owner name (raw, stored) - exact match
//! 3. `id` - schedule id (tokenized) - phrase search
//! 4. `sort_id` - schedule id (raw, stored) - sort and wildcard search
//! 5. `epoch` - i64 (indexed, fast, stored) - range filter and sort
//! 6. `timestamp` - i64 (indexed, fast, stored) - sort
//!
//! The payload never reaches the index. Writes go through [`ScheduleIndex::apply`]
//! which commits a whole batch and reloads the reader, so a search sees
//! either none or all of a batch.

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use scheduler_admin_store::{composite_key, Record};
use tantivy::{
    collector::{Count, DocSetCollector, TopDocs},
    query::{
        AllQuery, BooleanQuery, Occur as TantivyOccur, PhraseQuery, Query, RangeQuery, RegexQuery,
        TermQuery,
    },
    schema::{
        Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, FAST, INDEXED,
        STORED, TEXT,
    },
    tokenizer::TokenStream,
    DocAddress, Index, IndexReader, IndexWriter, Order, ReloadPolicy, Searcher, TantivyDocument,
    Term,
};
use tracing::{debug, info};

use crate::error::Result;
use crate::query::{Filter, SortBy, SortField, SortOrder};
use crate::sort::{sort_items, Sortable};
use crate::translate::{self, wildcard_to_regex, Clause, Occur};

pub const FIELD_KEY: &str = "key";
pub const FIELD_SCHEDULER: &str = "scheduler";
pub const FIELD_ID: &str = "id";
pub const FIELD_SORT_ID: &str = "sort_id";
pub const FIELD_EPOCH: &str = "epoch";
pub const FIELD_TIMESTAMP: &str = "timestamp";

/// Heap per indexing thread; tantivy requires at least 15MB.
const HEAP_PER_THREAD: usize = 25_000_000;
const MAX_WRITER_THREADS: usize = 4;

/// Field handles
#[derive(Debug, Clone)]
pub struct SchemaFields {
    pub schema: Schema,
    pub key: Field,
    pub scheduler: Field,
    pub id: Field,
    pub sort_id: Field,
    pub epoch: Field,
    pub timestamp: Field,
}

impl SchemaFields {
    pub fn new() -> Self {
        let mut builder = Schema::builder();

        // Keyword fields (no tokenization, exact match)
        let keyword = TextOptions::default()
            .set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer("raw")
                    .set_index_option(IndexRecordOption::Basic),
            )
            .set_stored();

        let key = builder.add_text_field(FIELD_KEY, keyword.clone());
        let scheduler = builder.add_text_field(FIELD_SCHEDULER, keyword.clone());
        let id = builder.add_text_field(FIELD_ID, TEXT);
        let sort_id = builder.add_text_field(FIELD_SORT_ID, keyword);
        let epoch = builder.add_i64_field(FIELD_EPOCH, INDEXED | FAST | STORED);
        let timestamp = builder.add_i64_field(FIELD_TIMESTAMP, INDEXED | FAST | STORED);

        Self {
            schema: builder.build(),
            key,
            scheduler,
            id,
            sort_id,
            epoch,
            timestamp,
        }
    }
}

impl Default for SchemaFields {
    fn default() -> Self {
        Self::new()
    }
}

/// Indexed projection of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDoc {
    pub owner_id: String,
    pub id: String,
    pub epoch: i64,
    pub timestamp: i64,
}

impl IndexDoc {
    pub fn key(&self) -> String {
        composite_key(&self.owner_id, &self.id)
    }
}

impl From<&Record> for IndexDoc {
    fn from(record: &Record) -> Self {
        Self {
            owner_id: record.owner_id.clone(),
            id: record.id.clone(),
            epoch: record.epoch,
            timestamp: record.timestamp,
        }
    }
}

/// One queued index write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOp {
    Upsert(IndexDoc),
    /// Delete by composite key
    Delete(String),
}

/// A matching document, enough to sort and to hydrate from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHit {
    pub key: String,
    pub owner_id: String,
    pub id: String,
    pub epoch: i64,
    pub timestamp: i64,
}

impl Sortable for IndexHit {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn sort_id(&self) -> &str {
        &self.id
    }

    fn epoch(&self) -> i64 {
        self.epoch
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Unclamped match count plus the requested page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexPage {
    pub total: usize,
    pub hits: Vec<IndexHit>,
}

/// Full-text index of schedules
///
/// All methods block; async callers run them on the blocking pool.
pub struct ScheduleIndex {
    index: Index,
    reader: IndexReader,
    writer: Arc<Mutex<IndexWriter>>,
    fields: SchemaFields,
}

impl ScheduleIndex {
    /// Open the index in `index_dir`, creating it if absent.
    pub fn open(index_dir: &Path) -> Result<Self> {
        let fields = SchemaFields::new();

        let index = if index_dir.join("meta.json").exists() {
            Index::open_in_dir(index_dir)?
        } else {
            std::fs::create_dir_all(index_dir)?;
            Index::create_in_dir(index_dir, fields.schema.clone())?
        };
        info!(path = %index_dir.display(), "schedule index opened");

        Self::with_index(index, fields)
    }

    /// RAM-only index (for testing)
    pub fn in_memory() -> Result<Self> {
        let fields = SchemaFields::new();
        let index = Index::create_in_ram(fields.schema.clone());
        Self::with_index(index, fields)
    }

    fn with_index(index: Index, fields: SchemaFields) -> Result<Self> {
        let threads = num_cpus::get().clamp(1, MAX_WRITER_THREADS);
        let writer = index.writer_with_num_threads(threads, threads * HEAP_PER_THREAD)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            fields,
        })
    }

    /// Number of live documents
    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    fn to_document(&self, doc: &IndexDoc) -> TantivyDocument {
        let mut document = TantivyDocument::default();
        document.add_text(self.fields.key, doc.key());
        document.add_text(self.fields.scheduler, &doc.owner_id);
        document.add_text(self.fields.id, &doc.id);
        document.add_text(self.fields.sort_id, &doc.id);
        document.add_i64(self.fields.epoch, doc.epoch);
        document.add_i64(self.fields.timestamp, doc.timestamp);
        document
    }

    /// Apply a batch of writes as one commit.
    ///
    /// An upsert replaces any document with the same composite key. On error
    /// the uncommitted part of the batch is rolled back.
    pub fn apply(&self, ops: &[IndexOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut writer = self.writer.lock();
        let staged = (|| -> Result<()> {
            for op in ops {
                match op {
                    IndexOp::Upsert(doc) => {
                        writer.delete_term(Term::from_field_text(self.fields.key, &doc.key()));
                        writer.add_document(self.to_document(doc))?;
                    }
                    IndexOp::Delete(key) => {
                        writer.delete_term(Term::from_field_text(self.fields.key, key));
                    }
                }
            }
            writer.commit()?;
            Ok(())
        })();

        if let Err(err) = staged {
            if let Err(rollback_err) = writer.rollback() {
                debug!(error = %rollback_err, "index rollback failed");
            }
            return Err(err);
        }
        drop(writer);

        self.reader.reload()?;
        debug!(ops = ops.len(), "index batch committed");
        Ok(())
    }

    /// Run `filter`, sort the matches and cut the page.
    ///
    /// `limit` of `None` returns every match. A bounded timestamp or epoch
    /// search only loads the page window from the fast field plus the ties
    /// on the window boundary; an id sort loads every match.
    pub fn search(&self, filter: &Filter, sort_by: SortBy, limit: Option<usize>) -> Result<IndexPage> {
        let clauses = translate::translate(filter);
        let query = self.build_query(&clauses)?;
        debug!(
            query = %translate::to_query_string(&clauses),
            sort = %sort_by,
            limit = ?limit,
            "index search"
        );

        let searcher = self.reader.searcher();
        let (total, mut hits) = match (sort_by.field, limit) {
            (SortField::Timestamp, Some(limit)) => {
                self.window_hits(&searcher, query, FIELD_TIMESTAMP, sort_by.order, limit)?
            }
            (SortField::Epoch, Some(limit)) => {
                self.window_hits(&searcher, query, FIELD_EPOCH, sort_by.order, limit)?
            }
            _ => {
                let addresses = searcher.search(query.as_ref(), &DocSetCollector)?;
                let hits = self.load_hits(&searcher, addresses)?;
                (hits.len(), hits)
            }
        };

        sort_items(&mut hits, sort_by);
        if let Some(limit) = limit {
            hits.truncate(limit);
        }

        Ok(IndexPage { total, hits })
    }

    /// Top `limit` matches by the i64 fast field `field`, widened to the
    /// whole group of documents sharing the boundary value.
    fn window_hits(
        &self,
        searcher: &Searcher,
        query: Box<dyn Query>,
        field: &str,
        order: SortOrder,
        limit: usize,
    ) -> Result<(usize, Vec<IndexHit>)> {
        if limit == 0 {
            return Ok((searcher.search(query.as_ref(), &Count)?, Vec::new()));
        }

        let order = match order {
            SortOrder::Asc => Order::Asc,
            SortOrder::Desc => Order::Desc,
        };
        let top = TopDocs::with_limit(limit).order_by_fast_field::<i64>(field, order);
        let (total, window) = searcher.search(query.as_ref(), &(Count, top))?;

        let boundary = window
            .last()
            .map(|(value, _)| *value)
            .filter(|_| window.len() < total);
        let Some(boundary) = boundary else {
            let hits = self.load_hits(searcher, window.into_iter().map(|(_, address)| address))?;
            return Ok((total, hits));
        };

        // the id tie break decides which boundary ties make the page
        let inside = window
            .into_iter()
            .filter(|(value, _)| *value != boundary)
            .map(|(_, address)| address);
        let mut hits = self.load_hits(searcher, inside)?;

        let on_boundary: Box<dyn Query> = Box::new(RangeQuery::new_i64_bounds(
            field.to_string(),
            Bound::Included(boundary),
            Bound::Included(boundary),
        ));
        let ties = BooleanQuery::new(vec![
            (TantivyOccur::Must, query),
            (TantivyOccur::Must, on_boundary),
        ]);
        let tied = searcher.search(&ties, &DocSetCollector)?;
        hits.extend(self.load_hits(searcher, tied)?);

        Ok((total, hits))
    }

    fn load_hits(
        &self,
        searcher: &Searcher,
        addresses: impl IntoIterator<Item = DocAddress>,
    ) -> Result<Vec<IndexHit>> {
        addresses
            .into_iter()
            .map(|address| -> Result<IndexHit> {
                let doc: TantivyDocument = searcher.doc(address)?;
                Ok(self.to_hit(&doc))
            })
            .collect()
    }

    /// Every document of `owner_id`.
    pub fn owner_hits(&self, owner_id: &str) -> Result<Vec<IndexHit>> {
        let filter = Filter {
            owner: owner_id.to_string(),
            ..Default::default()
        };
        Ok(self.search(&filter, SortBy::default(), None)?.hits)
    }

    fn to_hit(&self, doc: &TantivyDocument) -> IndexHit {
        let text = |field: Field| {
            doc.get_first(field)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };
        let number = |field: Field| doc.get_first(field).and_then(|v| v.as_i64()).unwrap_or(0);

        IndexHit {
            key: text(self.fields.key),
            owner_id: text(self.fields.scheduler),
            id: text(self.fields.sort_id),
            epoch: number(self.fields.epoch),
            timestamp: number(self.fields.timestamp),
        }
    }

    fn build_query(&self, clauses: &[Clause]) -> Result<Box<dyn Query>> {
        if clauses.is_empty() {
            return Ok(Box::new(AllQuery));
        }

        let mut subqueries: Vec<(TantivyOccur, Box<dyn Query>)> = Vec::with_capacity(clauses.len() + 1);
        for clause in clauses {
            let (occur, query): (Occur, Box<dyn Query>) = match clause {
                Clause::Owner(owner) => (
                    Occur::Must,
                    Box::new(TermQuery::new(
                        Term::from_field_text(self.fields.scheduler, owner),
                        IndexRecordOption::Basic,
                    )),
                ),
                Clause::IdPhrase { occur, phrase } => (*occur, self.phrase_query(phrase)?),
                Clause::IdWildcard { occur, pattern } => (
                    *occur,
                    Box::new(RegexQuery::from_pattern(
                        &wildcard_to_regex(pattern),
                        self.fields.sort_id,
                    )?),
                ),
                Clause::EpochAtLeast(from) => (
                    Occur::Must,
                    Box::new(RangeQuery::new_i64_bounds(
                        FIELD_EPOCH.to_string(),
                        Bound::Included(*from),
                        Bound::Unbounded,
                    )),
                ),
                Clause::EpochAtMost(to) => (
                    Occur::Must,
                    Box::new(RangeQuery::new_i64_bounds(
                        FIELD_EPOCH.to_string(),
                        Bound::Unbounded,
                        Bound::Included(*to),
                    )),
                ),
            };
            let occur = match occur {
                Occur::Must => TantivyOccur::Must,
                Occur::MustNot => TantivyOccur::MustNot,
            };
            subqueries.push((occur, query));
        }

        // a boolean query made only of exclusions matches nothing
        if subqueries.iter().all(|(occur, _)| *occur == TantivyOccur::MustNot) {
            subqueries.push((TantivyOccur::Must, Box::new(AllQuery)));
        }

        Ok(Box::new(BooleanQuery::new(subqueries)))
    }

    /// Query for an id phrase, tokenized like the indexed ids.
    fn phrase_query(&self, phrase: &str) -> Result<Box<dyn Query>> {
        let mut analyzer = self.index.tokenizer_for_field(self.fields.id)?;
        let mut stream = analyzer.token_stream(phrase);
        let mut terms = Vec::new();
        while stream.advance() {
            terms.push(Term::from_field_text(self.fields.id, &stream.token().text));
        }

        Ok(match terms.len() {
            // nothing tokenizable, fall back to the whole id
            0 => Box::new(TermQuery::new(
                Term::from_field_text(self.fields.sort_id, phrase),
                IndexRecordOption::Basic,
            )),
            1 => Box::new(TermQuery::new(
                terms.remove(0),
                IndexRecordOption::Basic,
            )),
            _ => Box::new(PhraseQuery::new(terms)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::EpochRange;
    use tempfile::TempDir;

    fn doc(owner: &str, id: &str, epoch: i64, timestamp: i64) -> IndexOp {
        IndexOp::Upsert(IndexDoc {
            owner_id: owner.to_string(),
            id: id.to_string(),
            epoch,
            timestamp,
        })
    }

    fn owner_filter(owner: &str) -> Filter {
        Filter {
            owner: owner.to_string(),
            ..Default::default()
        }
    }

    fn ids(page: &IndexPage) -> Vec<&str> {
        page.hits.iter().map(|h| h.id.as_str()).collect()
    }

    #[test]
    fn test_upsert_replaces_document() {
        let index = ScheduleIndex::in_memory().unwrap();

        index.apply(&[doc("s1", "a", 1, 1)]).unwrap();
        index.apply(&[doc("s1", "a", 2, 2)]).unwrap();

        assert_eq!(index.doc_count(), 1);
        let page = index.search(&owner_filter("s1"), SortBy::default(), None).unwrap();
        assert_eq!(page.hits[0].epoch, 2);
        assert_eq!(page.hits[0].key, "s1|a");
    }

    #[test]
    fn test_delete_by_key() {
        let index = ScheduleIndex::in_memory().unwrap();

        index.apply(&[doc("s1", "a", 1, 1), doc("s2", "a", 1, 1)]).unwrap();
        index.apply(&[IndexOp::Delete("s1|a".to_string())]).unwrap();

        assert_eq!(index.doc_count(), 1);
        assert!(index.owner_hits("s1").unwrap().is_empty());
        assert_eq!(index.owner_hits("s2").unwrap().len(), 1);
    }

    #[test]
    fn test_owner_is_exact_match() {
        let index = ScheduleIndex::in_memory().unwrap();
        index
            .apply(&[doc("scheduler-1", "a", 1, 1), doc("scheduler-10", "b", 1, 1)])
            .unwrap();

        let page = index
            .search(&owner_filter("scheduler-1"), SortBy::default(), None)
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(ids(&page), vec!["a"]);
    }

    #[test]
    fn test_id_terms() {
        let index = ScheduleIndex::in_memory().unwrap();
        index
            .apply(&[
                doc("s1", "video-1", 1, 1),
                doc("s1", "video-trailer-2", 1, 2),
                doc("s1", "audio-3", 1, 3),
            ])
            .unwrap();
        let asc = SortBy::new(SortField::Timestamp, SortOrder::Asc);

        let search = |terms: &str| {
            let filter = Filter {
                schedule_id: terms.to_string(),
                ..Default::default()
            };
            index.search(&filter, asc, None).unwrap()
        };

        assert_eq!(ids(&search("video")), vec!["video-1", "video-trailer-2"]);
        assert_eq!(ids(&search("video -trailer")), vec!["video-1"]);
        assert_eq!(ids(&search("-video")), vec!["audio-3"]);
        assert_eq!(ids(&search("video-1")), vec!["video-1"]);
        assert_eq!(ids(&search("vid*")), vec!["video-1", "video-trailer-2"]);
        assert_eq!(ids(&search("*-3")), vec!["audio-3"]);
    }

    #[test]
    fn test_epoch_range_inclusive() {
        let index = ScheduleIndex::in_memory().unwrap();
        index
            .apply(&[doc("s1", "a", 10, 1), doc("s1", "b", 20, 2), doc("s1", "c", 30, 3)])
            .unwrap();
        let filter = |from, to| Filter {
            epoch: EpochRange::new(from, to),
            ..Default::default()
        };
        let by_epoch = SortBy::new(SortField::Epoch, SortOrder::Asc);

        let page = index.search(&filter(10, 20), by_epoch, None).unwrap();
        assert_eq!(ids(&page), vec!["a", "b"]);

        let page = index.search(&filter(20, 0), by_epoch, None).unwrap();
        assert_eq!(ids(&page), vec!["b", "c"]);
    }

    #[test]
    fn test_total_is_unclamped() {
        let index = ScheduleIndex::in_memory().unwrap();
        let ops: Vec<IndexOp> = (0..15).map(|i| doc("s1", &format!("id-{:02}", i), i, i)).collect();
        index.apply(&ops).unwrap();

        let page = index.search(&owner_filter("s1"), SortBy::default(), Some(10)).unwrap();
        assert_eq!(page.total, 15);
        assert_eq!(page.hits.len(), 10);
        // timestamp desc
        assert_eq!(page.hits[0].id, "id-14");
    }

    #[test]
    fn test_bounded_page_matches_full_sort() {
        let index = ScheduleIndex::in_memory().unwrap();
        // ten documents share each timestamp, ids out of order within a group
        let ops: Vec<IndexOp> = (0..300)
            .map(|i| doc("s1", &format!("id-{:03}", (i * 7) % 300), i % 25, i / 10))
            .collect();
        for batch in ops.chunks(40) {
            index.apply(batch).unwrap();
        }

        let sorts = [
            SortBy::new(SortField::Timestamp, SortOrder::Desc),
            SortBy::new(SortField::Timestamp, SortOrder::Asc),
            SortBy::new(SortField::Epoch, SortOrder::Asc),
            SortBy::new(SortField::Epoch, SortOrder::Desc),
            SortBy::new(SortField::Id, SortOrder::Asc),
        ];
        for sort_by in sorts {
            let full = index.search(&owner_filter("s1"), sort_by, None).unwrap();
            for limit in [1, 15, 20, 299, 300, 500] {
                let page = index.search(&owner_filter("s1"), sort_by, Some(limit)).unwrap();
                assert_eq!(page.total, 300, "{} limit {}", sort_by, limit);
                let expected: Vec<&str> = ids(&full).into_iter().take(limit).collect();
                assert_eq!(ids(&page), expected, "{} limit {}", sort_by, limit);
            }
        }
    }

    #[test]
    fn test_zero_limit_counts_only() {
        let index = ScheduleIndex::in_memory().unwrap();
        index.apply(&[doc("s1", "a", 1, 1), doc("s1", "b", 2, 2)]).unwrap();

        let page = index.search(&owner_filter("s1"), SortBy::default(), Some(0)).unwrap();
        assert_eq!(page.total, 2);
        assert!(page.hits.is_empty());
    }

    #[test]
    fn test_bounded_page_respects_filter_on_ties() {
        let index = ScheduleIndex::in_memory().unwrap();
        index
            .apply(&[
                doc("s1", "b", 1, 5),
                doc("s1", "a", 1, 5),
                doc("s2", "0", 1, 5),
                doc("s1", "c", 1, 9),
            ])
            .unwrap();

        let page = index.search(&owner_filter("s1"), SortBy::default(), Some(2)).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(ids(&page), vec!["c", "a"]);
    }

    #[test]
    fn test_reopen_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index");

        {
            let index = ScheduleIndex::open(&path).unwrap();
            index.apply(&[doc("s1", "a", 1, 1)]).unwrap();
        }

        let index = ScheduleIndex::open(&path).unwrap();
        assert_eq!(index.doc_count(), 1);
    }
}
