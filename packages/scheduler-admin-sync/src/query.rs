//! Search query model
//!
//! A query is a filter (owner, id terms, epoch range), a sort and a page
//! limit. [`SearchQuery::from_params`] builds one from the admin API's query
//! parameters, where anything unparseable falls back to "unset".

use std::fmt;

use serde::{Deserialize, Serialize};

/// Field a result page is ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    #[default]
    Timestamp,
    Id,
    Epoch,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::Timestamp => "timestamp",
            SortField::Id => "id",
            SortField::Epoch => "epoch",
        }
    }

    /// Case-insensitive; anything unknown sorts by timestamp.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "id" => SortField::Id,
            "epoch" => SortField::Epoch,
            _ => SortField::Timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }

    /// Case-insensitive; anything unknown is descending.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => SortOrder::Asc,
            _ => SortOrder::Desc,
        }
    }
}

/// Primary sort key of a search; ties are broken by [`crate::sort`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SortBy {
    pub field: SortField,
    pub order: SortOrder,
}

impl SortBy {
    pub fn new(field: SortField, order: SortOrder) -> Self {
        Self { field, order }
    }

    /// Parse `"<field> <order>"`.
    ///
    /// A lone `asc`/`desc` applies to timestamp, a lone field keeps the
    /// default order and more than two words fall back to the default sort.
    pub fn parse(s: &str) -> Self {
        let lowered = s.trim().to_ascii_lowercase();
        let words: Vec<&str> = lowered.split_whitespace().collect();
        match words.as_slice() {
            [term] if *term == "asc" || *term == "desc" => {
                Self::new(SortField::Timestamp, SortOrder::parse(term))
            }
            [field] => Self::new(SortField::parse(field), SortOrder::default()),
            [field, order] => Self::new(SortField::parse(field), SortOrder::parse(order)),
            _ => Self::default(),
        }
    }
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field.as_str(), self.order.as_str())
    }
}

/// Inclusive epoch bounds, `0` meaning unset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EpochRange {
    pub from: i64,
    pub to: i64,
}

impl EpochRange {
    pub fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }

    pub fn lower(&self) -> Option<i64> {
        (self.from != 0).then_some(self.from)
    }

    pub fn upper(&self) -> Option<i64> {
        (self.to != 0).then_some(self.to)
    }
}

/// Empty strings mean "no constraint"
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Filter {
    /// Exact owner name
    pub owner: String,
    /// Whitespace separated id terms, optionally prefixed with `+`/`-`
    pub schedule_id: String,
    pub epoch: EpochRange,
}

/// How many hits a search returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Limit {
    /// Requested page size; `<= 0` selects the default page
    Max(i64),
    /// Every match, used internally by owner resets
    Unbounded,
}

impl Default for Limit {
    fn default() -> Self {
        Limit::Max(0)
    }
}

impl Limit {
    /// Page size to apply, `None` for unbounded.
    pub fn resolve(&self, default_page: usize, ceiling: usize) -> Option<usize> {
        match *self {
            Limit::Unbounded => None,
            Limit::Max(n) if n <= 0 => Some(default_page),
            Limit::Max(n) => Some(usize::try_from(n).unwrap_or(usize::MAX).min(ceiling)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub filter: Filter,
    pub sort_by: SortBy,
    pub limit: Limit,
}

/// Query parameter names of the admin API
pub mod params {
    pub const SCHEDULER_NAME: &str = "scheduler-name";
    pub const SCHEDULE_ID: &str = "schedule-id";
    pub const EPOCH_FROM: &str = "epoch-from";
    pub const EPOCH_TO: &str = "epoch-to";
    pub const SORT_BY: &str = "sort-by";
    pub const MAX: &str = "max";
}

impl SearchQuery {
    /// Everything of one owner.
    pub fn for_owner(owner: impl Into<String>) -> Self {
        Self {
            filter: Filter {
                owner: owner.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_schedule_id(mut self, terms: impl Into<String>) -> Self {
        self.filter.schedule_id = terms.into();
        self
    }

    pub fn with_epoch(mut self, from: i64, to: i64) -> Self {
        self.filter.epoch = EpochRange::new(from, to);
        self
    }

    pub fn sorted_by(mut self, field: SortField, order: SortOrder) -> Self {
        self.sort_by = SortBy::new(field, order);
        self
    }

    pub fn with_max(mut self, max: i64) -> Self {
        self.limit = Limit::Max(max);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.limit = Limit::Unbounded;
        self
    }

    /// Build a query from `(name, value)` parameter pairs.
    ///
    /// Unknown parameters are ignored; unparseable numbers become `0`.
    pub fn from_params<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut query = SearchQuery::default();
        for (name, value) in pairs {
            match name {
                params::SCHEDULER_NAME => query.filter.owner = value.trim().to_string(),
                params::SCHEDULE_ID => query.filter.schedule_id = value.trim().to_string(),
                params::EPOCH_FROM => query.filter.epoch.from = parse_number(value),
                params::EPOCH_TO => query.filter.epoch.to = parse_number(value),
                params::SORT_BY => query.sort_by = SortBy::parse(value),
                params::MAX => query.limit = Limit::Max(parse_number(value)),
                _ => {}
            }
        }
        query
    }
}

fn parse_number(value: &str) -> i64 {
    value.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_by_parse() {
        let cases = [
            ("", SortBy::new(SortField::Timestamp, SortOrder::Desc)),
            ("asc", SortBy::new(SortField::Timestamp, SortOrder::Asc)),
            ("DESC", SortBy::new(SortField::Timestamp, SortOrder::Desc)),
            ("id", SortBy::new(SortField::Id, SortOrder::Desc)),
            ("epoch asc", SortBy::new(SortField::Epoch, SortOrder::Asc)),
            ("Id ASC", SortBy::new(SortField::Id, SortOrder::Asc)),
            ("unknown asc", SortBy::new(SortField::Timestamp, SortOrder::Asc)),
            ("epoch sideways", SortBy::new(SortField::Epoch, SortOrder::Desc)),
            ("  id   asc  ", SortBy::new(SortField::Id, SortOrder::Asc)),
            ("a b c", SortBy::default()),
        ];

        for (input, expected) in cases {
            assert_eq!(SortBy::parse(input), expected, "input {:?}", input);
        }
    }

    #[test]
    fn test_limit_resolution() {
        assert_eq!(Limit::Max(0).resolve(100, 1000), Some(100));
        assert_eq!(Limit::Max(-5).resolve(100, 1000), Some(100));
        assert_eq!(Limit::Max(20).resolve(100, 1000), Some(20));
        assert_eq!(Limit::Max(5000).resolve(100, 1000), Some(1000));
        assert_eq!(Limit::Unbounded.resolve(100, 1000), None);
    }

    #[test]
    fn test_epoch_zero_is_unset() {
        let range = EpochRange::new(0, 50);
        assert_eq!(range.lower(), None);
        assert_eq!(range.upper(), Some(50));
        assert_eq!(EpochRange::default().lower(), None);
    }

    #[test]
    fn test_from_params() {
        let query = SearchQuery::from_params([
            ("scheduler-name", "scheduler-1"),
            ("schedule-id", " video -trailer "),
            ("epoch-from", "100"),
            ("epoch-to", "not-a-number"),
            ("sort-by", "epoch asc"),
            ("max", "25"),
            ("unrelated", "x"),
        ]);

        assert_eq!(query.filter.owner, "scheduler-1");
        assert_eq!(query.filter.schedule_id, "video -trailer");
        assert_eq!(query.filter.epoch, EpochRange::new(100, 0));
        assert_eq!(query.sort_by, SortBy::new(SortField::Epoch, SortOrder::Asc));
        assert_eq!(query.limit, Limit::Max(25));
    }

    #[test]
    fn test_from_params_bad_max_uses_default_page() {
        let query = SearchQuery::from_params([("max", "lots")]);
        assert_eq!(query.limit.resolve(100, 1000), Some(100));
    }
}
