//! Result ordering with deterministic tie-breaks
//!
//! | primary           | secondary       | last resort |
//! |-------------------|-----------------|-------------|
//! | timestamp (order) | id ascending    | owner asc   |
//! | epoch (order)     | id ascending    | owner asc   |
//! | id (order)        | timestamp desc  | owner asc   |
//!
//! The owner key only matters when two owners hold the same id with equal
//! sort values; it keeps paging stable across owners.

use std::cmp::Ordering;

use scheduler_admin_store::Record;

use crate::query::{SortBy, SortField, SortOrder};

/// Anything a result page can be ordered by
pub trait Sortable {
    fn owner_id(&self) -> &str;
    fn sort_id(&self) -> &str;
    fn epoch(&self) -> i64;
    fn timestamp(&self) -> i64;
}

impl Sortable for Record {
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

fn directed(ordering: Ordering, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Asc => ordering,
        SortOrder::Desc => ordering.reverse(),
    }
}

/// Total order of two items under `sort_by`.
pub fn compare<T: Sortable + ?Sized>(a: &T, b: &T, sort_by: SortBy) -> Ordering {
    let primary_then_secondary = match sort_by.field {
        SortField::Timestamp => directed(a.timestamp().cmp(&b.timestamp()), sort_by.order)
            .then_with(|| a.sort_id().cmp(b.sort_id())),
        SortField::Epoch => directed(a.epoch().cmp(&b.epoch()), sort_by.order)
            .then_with(|| a.sort_id().cmp(b.sort_id())),
        SortField::Id => directed(a.sort_id().cmp(b.sort_id()), sort_by.order)
            .then_with(|| b.timestamp().cmp(&a.timestamp())),
    };
    primary_then_secondary.then_with(|| a.owner_id().cmp(b.owner_id()))
}

/// Sort `items` in place.
pub fn sort_items<T: Sortable>(items: &mut [T], sort_by: SortBy) {
    items.sort_by(|a, b| compare(a, b, sort_by));
}
