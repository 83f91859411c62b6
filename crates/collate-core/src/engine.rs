//! # Query Engine
//!
//! Evaluates a [`QuerySpec`] against an in-memory collection in a fixed
//! order: search, then filter, then sort. Each stage keeps the relative
//! order of what it is given, so the output is fully determined by the
//! input order and the spec.
//!
//! Field names the schema does not know are skipped by the filter and sort
//! stages rather than rejected; callers and records are allowed to drift.

use crate::paginate::{paginate, Page};
use crate::record::{Field, Schema};
use crate::spec::{Filter, QuerySpec, SortDirection, SpecError};
use crate::value::CollationKey;
use std::cmp::Ordering;

/// Pure, synchronous evaluator bound to one schema.
pub struct QueryEngine<R> {
    schema: Schema<R>,
}

impl<R> Clone for QueryEngine<R> {
    fn clone(&self) -> Self {
        Self {
            schema: self.schema.clone(),
        }
    }
}

impl<R> QueryEngine<R> {
    pub fn new(schema: Schema<R>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Schema<R> {
        &self.schema
    }

    /// Search, filter and sort `records`. Pagination is left to the caller.
    pub fn evaluate<'a>(&self, records: &'a [R], spec: &QuerySpec) -> Vec<&'a R> {
        let mut matched: Vec<&'a R> = records.iter().collect();
        if let Some(text) = spec.search_text() {
            matched = self.search(matched, text);
        }
        matched = self.filter(matched, spec);
        self.sort(matched, spec)
    }

    /// Validate `spec`, evaluate it and cut out the requested page.
    pub fn execute(&self, records: &[R], spec: &QuerySpec) -> Result<Page<R>, SpecError>
    where
        R: Clone,
    {
        spec.validate()?;
        let matched = self.evaluate(records, spec);
        Ok(paginate(&matched, &spec.page).cloned())
    }

    fn search<'a>(&self, records: Vec<&'a R>, text: &str) -> Vec<&'a R> {
        let needle = text.to_lowercase();
        let fields: Vec<&Field<R>> = self.schema.searchable_fields().collect();
        records
            .into_iter()
            .filter(|r| {
                fields.iter().any(|f| {
                    f.read(r)
                        .as_ref()
                        .and_then(|v| v.as_text())
                        .is_some_and(|s| s.to_lowercase().contains(&needle))
                })
            })
            .collect()
    }

    fn filter<'a>(&self, mut records: Vec<&'a R>, spec: &QuerySpec) -> Vec<&'a R> {
        for (name, filter) in &spec.filters {
            if matches!(filter, Filter::All) {
                continue;
            }
            let Some(field) = self.schema.get(name) else {
                continue;
            };
            records.retain(|r| filter.accepts(field.read(r).as_ref()));
        }
        records
    }

    fn sort<'a>(&self, records: Vec<&'a R>, spec: &QuerySpec) -> Vec<&'a R> {
        let keys: Vec<(&Field<R>, SortDirection)> = spec
            .sort
            .iter()
            .filter_map(|k| self.schema.get(&k.field).map(|f| (f, k.direction)))
            .collect();
        if keys.is_empty() || records.len() < 2 {
            return records;
        }

        // Read every key once up front; accessors may allocate.
        let mut decorated: Vec<(&'a R, Vec<Option<CollationKey>>)> = records
            .into_iter()
            .map(|r| {
                let row = keys
                    .iter()
                    .map(|(f, _)| f.read(r).map(|v| v.collation_key()))
                    .collect();
                (r, row)
            })
            .collect();

        // `sort_by` is stable: full ties keep their post-filter order.
        decorated.sort_by(|(_, a), (_, b)| {
            keys.iter()
                .zip(a.iter().zip(b.iter()))
                .map(|((_, direction), (x, y))| compare_keys(x.as_ref(), y.as_ref(), *direction))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });

        decorated.into_iter().map(|(r, _)| r).collect()
    }
}

/// Missing values collate first in both directions; only present values
/// are affected by `direction`.
fn compare_keys(
    a: Option<&CollationKey>,
    b: Option<&CollationKey>,
    direction: SortDirection,
) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => match direction {
            SortDirection::Asc => x.cmp(y),
            SortDirection::Desc => y.cmp(x),
        },
    }
}
