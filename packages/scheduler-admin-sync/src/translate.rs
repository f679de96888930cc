//! Filter → index clauses
//!
//! Translation rules:
//! - owner: one required exact term
//! - schedule id: whitespace separated terms, each required unless prefixed
//!   with `-` (`+` is accepted and redundant); terms containing `*` are
//!   wildcards, all others match as a phrase
//! - epoch bounds: inclusive ranges, `0` means unset
//!
//! `Display` renders the clauses in the familiar query string syntax
//! (`+id:"video" -id:trail* +scheduler:"s1" +epoch:>=100`), which is what the
//! search path logs.

use std::fmt;

use crate::query::Filter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occur {
    Must,
    MustNot,
}

impl Occur {
    fn prefix(&self) -> char {
        match self {
            Occur::Must => '+',
            Occur::MustNot => '-',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    /// Exact owner name
    Owner(String),
    /// Id phrase, matched against the tokenized id
    IdPhrase { occur: Occur, phrase: String },
    /// Id wildcard (`*` any run, `?` one char), matched against the whole id
    IdWildcard { occur: Occur, pattern: String },
    EpochAtLeast(i64),
    EpochAtMost(i64),
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Owner(owner) => write!(f, "+scheduler:{:?}", owner),
            Clause::IdPhrase { occur, phrase } => write!(f, "{}id:{:?}", occur.prefix(), phrase),
            Clause::IdWildcard { occur, pattern } => write!(f, "{}id:{}", occur.prefix(), pattern),
            Clause::EpochAtLeast(from) => write!(f, "+epoch:>={}", from),
            Clause::EpochAtMost(to) => write!(f, "+epoch:<={}", to),
        }
    }
}

/// Split `+video` into its operator and term. A lone character is a term.
fn split_operator(term: &str) -> (Occur, &str) {
    if term.chars().count() > 1 {
        if let Some(rest) = term.strip_prefix('-') {
            return (Occur::MustNot, rest);
        }
        if let Some(rest) = term.strip_prefix('+') {
            return (Occur::Must, rest);
        }
    }
    (Occur::Must, term)
}

pub fn translate(filter: &Filter) -> Vec<Clause> {
    let mut clauses = Vec::new();

    for raw in filter.schedule_id.split_whitespace() {
        let (occur, term) = split_operator(raw);
        if term.contains('*') {
            clauses.push(Clause::IdWildcard {
                occur,
                pattern: term.to_string(),
            });
        } else {
            clauses.push(Clause::IdPhrase {
                occur,
                phrase: term.to_string(),
            });
        }
    }

    let owner = filter.owner.trim();
    if !owner.is_empty() {
        clauses.push(Clause::Owner(owner.to_string()));
    }

    if let Some(from) = filter.epoch.lower() {
        clauses.push(Clause::EpochAtLeast(from));
    }
    if let Some(to) = filter.epoch.upper() {
        clauses.push(Clause::EpochAtMost(to));
    }

    clauses
}

/// Render clauses as a query string (empty for match-all).
pub fn to_query_string(clauses: &[Clause]) -> String {
    clauses
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Anchored regex equivalent of a wildcard pattern.
pub fn wildcard_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() * 2);
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '*' | '?' => {
                regex.push_str(&regex::escape(&literal));
                literal.clear();
                regex.push_str(if c == '*' { ".*" } else { "." });
            }
            _ => literal.push(c),
        }
    }
    regex.push_str(&regex::escape(&literal));
    regex
}
