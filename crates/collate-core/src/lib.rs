//! # collate-core: The Model of COLLATE
//!
//! Everything here is synchronous and pure: field values and their
//! collation order, query specs, the query engine and the paginator. The
//! async side (sources, aggregation, the controller) lives in `collate-io`.
//!
//! A query always runs in the same order over one flat collection:
//! search, filter, stable sort, then paginate.

pub mod engine;
pub mod paginate;
pub mod parser;
pub mod record;
pub mod spec;
pub mod value;

pub use engine::QueryEngine;
pub use paginate::{paginate, Page};
pub use parser::{parse, ParseError};
pub use record::{Accessor, Field, FieldKind, FieldSpec, JsonRecord, Schema};
pub use spec::{Filter, PageSpec, QuerySpec, SortDirection, SortKey, SpecError, DEFAULT_PAGE_SIZE};
pub use value::{parse_date, CollationKey, Value};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one parent resource (a store, a tenant, a project...)
/// whose children are fetched and merged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParentKey(pub String);

impl ParentKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParentKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParentKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for ParentKey {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// A parent whose fetch failed during aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub parent_key: ParentKey,
    /// Human-readable cause.
    pub cause: String,
}

/// Outcome of one controller run: a page of records plus the failures
/// collected while aggregating them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult<R> {
    pub items: Vec<R>,
    pub total_matched: usize,
    pub has_more: bool,
    /// Parents excluded from this result, in input order.
    pub failures: Vec<FetchFailure>,
    /// Sequence number of the run that produced this result.
    pub generation: u64,
}

impl<R> QueryResult<R> {
    pub fn from_page(page: Page<R>, failures: Vec<FetchFailure>, generation: u64) -> Self {
        Self {
            items: page.items,
            total_matched: page.total_matched,
            has_more: page.has_more,
            failures,
            generation,
        }
    }

    /// True if at least one parent could not be fetched.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_key_is_transparent() {
        let key = ParentKey::from(42u64);
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"42\"");
        assert_eq!(key.to_string(), "42");
        let back: ParentKey = serde_json::from_str("\"store-a\"").unwrap();
        assert_eq!(back, ParentKey::from("store-a"));
    }

    #[test]
    fn test_result_from_page() {
        let page = paginate(&[1, 2, 3], &PageSpec::Indexed { index: 0, size: 2 });
        let failures = vec![FetchFailure {
            parent_key: "3".into(),
            cause: "timeout".into(),
        }];
        let result = QueryResult::from_page(page, failures, 7);
        assert_eq!(result.items, vec![1, 2]);
        assert_eq!(result.total_matched, 3);
        assert!(result.has_more);
        assert!(result.is_partial());
        assert_eq!(result.generation, 7);
    }
}
