//! # Query Specs
//!
//! A [`QuerySpec`] is the complete, immutable description of one query:
//! search text, filters, sort keys and the page window. Evaluating the same
//! spec against the same collection always yields the same result.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Page size used when a spec does not name one.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Declarative query state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySpec {
    /// Free-text search; blank means no search.
    pub search: String,
    /// Per-field filters, ANDed together. Ordered so evaluation is stable.
    pub filters: BTreeMap<String, Filter>,
    /// Sort keys, most significant first.
    pub sort: Vec<SortKey>,
    pub page: PageSpec,
}

/// A predicate over one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    /// Match-all. Kept as its own variant so that a literal `"all"` value
    /// can still be filtered on with `Eq`.
    All,
    Eq(Value),
    AnyOf(Vec<Value>),
    /// Inclusive on both ends; an absent bound is open.
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<Value>,
    },
}

impl Filter {
    /// Test a record's value. A missing value only passes [`Filter::All`].
    pub fn accepts(&self, value: Option<&Value>) -> bool {
        let value = match (self, value) {
            (Filter::All, _) => return true,
            (_, None) => return false,
            (_, Some(v)) => v,
        };
        match self {
            Filter::All => true,
            Filter::Eq(wanted) => value.matches(wanted),
            Filter::AnyOf(options) => options.iter().any(|o| value.matches(o)),
            Filter::Range { min, max } => {
                let above = min
                    .as_ref()
                    .map_or(true, |m| value.compare_to(m).is_some_and(|o| o.is_ge()));
                let below = max
                    .as_ref()
                    .map_or(true, |m| value.compare_to(m).is_some_and(|o| o.is_le()));
                above && below
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: SortDirection::Desc,
        }
    }
}

/// Page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSpec {
    /// Zero-based page `index` of `size` items.
    Indexed { index: usize, size: usize },
    /// The first `visible_count` items ("load more").
    Reveal { visible_count: usize },
}

impl Default for PageSpec {
    fn default() -> Self {
        PageSpec::Indexed {
            index: 0,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// A malformed spec or schema. These are caller bugs, not runtime faults.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpecError {
    #[error("page size must be greater than zero")]
    ZeroPageSize,
    #[error("field name must not be empty")]
    EmptyFieldName,
    #[error("sort key '{0}' appears more than once")]
    DuplicateSortKey(String),
    #[error("field '{0}' declared more than once")]
    DuplicateField(String),
    #[error("range on '{0}' has min greater than max")]
    InvertedRange(String),
}

impl QuerySpec {
    /// A spec that only searches.
    pub fn search(text: &str) -> Self {
        Self {
            search: text.to_string(),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, field: &str, filter: Filter) -> Self {
        self.filters.insert(field.to_string(), filter);
        self
    }

    pub fn with_sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn with_page(mut self, page: PageSpec) -> Self {
        self.page = page;
        self
    }

    /// The search text the engine will use, or `None` for no search.
    pub fn search_text(&self) -> Option<&str> {
        let trimmed = self.search.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    /// Reject malformed specs before evaluation.
    pub fn validate(&self) -> Result<(), SpecError> {
        if let PageSpec::Indexed { size: 0, .. } = self.page {
            return Err(SpecError::ZeroPageSize);
        }

        let mut seen = HashSet::new();
        for key in &self.sort {
            if key.field.trim().is_empty() {
                return Err(SpecError::EmptyFieldName);
            }
            if !seen.insert(key.field.as_str()) {
                return Err(SpecError::DuplicateSortKey(key.field.clone()));
            }
        }

        for (field, filter) in &self.filters {
            if field.trim().is_empty() {
                return Err(SpecError::EmptyFieldName);
            }
            if let Filter::Range {
                min: Some(min),
                max: Some(max),
            } = filter
            {
                if min.compare_to(max).is_some_and(|o| o.is_gt()) {
                    return Err(SpecError::InvertedRange(field.clone()));
                }
            }
        }
        Ok(())
    }
}
