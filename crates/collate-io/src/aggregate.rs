//! # Aggregator
//!
//! Fans out one fetch per parent key with bounded concurrency and merges
//! the results into a single flat collection.
//!
//! - Records are concatenated in parent-key input order, each parent's
//!   records in the order its fetch returned them, however the fetches
//!   happen to complete.
//! - A failed (or timed out, or panicking) fetch excludes that parent and
//!   is reported in [`Aggregation::failures`]; it never fails the whole
//!   aggregation.

use crate::source::{RecordSource, SourceError};
use collate_core::{FetchFailure, ParentKey};
use futures::{stream, FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

fn default_concurrency() -> usize {
    8
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Maximum fetches in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Per-fetch deadline. `None` waits indefinitely.
    #[serde(default)]
    pub fetch_timeout_ms: Option<u64>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            fetch_timeout_ms: None,
        }
    }
}

impl AggregatorConfig {
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("parent key '{0}' listed more than once")]
    DuplicateParentKey(ParentKey),
    #[error("failed to list parent keys: {0}")]
    ListParents(#[source] SourceError),
}

/// What one parent's fetch produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<R> {
    Success(Vec<R>),
    Failure(FetchFailure),
}

/// Merged output of one aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation<R> {
    pub records: Vec<R>,
    /// Failed parents, in input order.
    pub failures: Vec<FetchFailure>,
    /// Parent keys that were requested, in input order.
    pub parents: Vec<ParentKey>,
}

impl<R> Aggregation<R> {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// True when every requested parent failed. An empty request is not a
    /// failure.
    pub fn all_failed(&self) -> bool {
        !self.parents.is_empty() && self.failures.len() == self.parents.len()
    }
}

/// Concurrent fan-out over a [`RecordSource`].
pub struct Aggregator<S> {
    source: S,
    config: AggregatorConfig,
}

impl<S: RecordSource> Aggregator<S> {
    pub fn new(source: S, config: AggregatorConfig) -> Self {
        Self { source, config }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Fetch every parent in `keys` and merge the results.
    ///
    /// Duplicate keys are rejected before any fetch is issued. An empty key
    /// list yields an empty aggregation without touching the source.
    pub async fn aggregate(
        &self,
        keys: &[ParentKey],
    ) -> Result<Aggregation<S::Record>, AggregateError> {
        let mut seen = HashSet::with_capacity(keys.len());
        for key in keys {
            if !seen.insert(key) {
                return Err(AggregateError::DuplicateParentKey(key.clone()));
            }
        }

        if keys.is_empty() {
            return Ok(Aggregation {
                records: Vec::new(),
                failures: Vec::new(),
                parents: Vec::new(),
            });
        }

        let started = Instant::now();
        let concurrency = self.config.concurrency.max(1);
        tracing::debug!(
            "Aggregating {} parents from {} (concurrency {})",
            keys.len(),
            self.source.name(),
            concurrency
        );

        let mut outcomes: Vec<(usize, FetchOutcome<S::Record>)> =
            stream::iter(keys.iter().cloned().enumerate())
                .map(|(i, key)| async move { (i, self.fetch_one(&key).await) })
                .buffer_unordered(concurrency)
                .collect()
                .await;
        // Completion order is arbitrary; merge order is input order.
        outcomes.sort_by_key(|(i, _)| *i);

        let mut records = Vec::new();
        let mut failures = Vec::new();
        for (_, outcome) in outcomes {
            match outcome {
                FetchOutcome::Success(mut batch) => records.append(&mut batch),
                FetchOutcome::Failure(failure) => failures.push(failure),
            }
        }

        if failures.len() == keys.len() {
            tracing::warn!("All {} parent fetches failed", keys.len());
        } else {
            tracing::info!(
                "Aggregated {} records from {}/{} parents in {:?}",
                records.len(),
                keys.len() - failures.len(),
                keys.len(),
                started.elapsed()
            );
        }

        Ok(Aggregation {
            records,
            failures,
            parents: keys.to_vec(),
        })
    }

    /// List the source's parent keys, then aggregate all of them.
    pub async fn aggregate_all(&self) -> Result<Aggregation<S::Record>, AggregateError> {
        let keys = self
            .source
            .list_parent_keys()
            .await
            .map_err(AggregateError::ListParents)?;
        self.aggregate(&keys).await
    }

    async fn fetch_one(&self, key: &ParentKey) -> FetchOutcome<S::Record> {
        let fetch = AssertUnwindSafe(self.source.fetch(key)).catch_unwind();
        let outcome = match self.config.fetch_timeout() {
            Some(limit) => match tokio::time::timeout(limit, fetch).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(SourceError::Timeout(limit))),
            },
            None => fetch.await,
        };

        let cause = match outcome {
            Ok(Ok(batch)) => {
                tracing::debug!("Fetched {} records for parent {}", batch.len(), key);
                return FetchOutcome::Success(batch);
            }
            Ok(Err(e)) => {
                tracing::warn!("Fetch failed for parent {}: {}", key, e);
                e.to_string()
            }
            Err(_) => {
                tracing::error!("Fetch panicked for parent {}", key);
                "fetch panicked".to_string()
            }
        };
        FetchOutcome::Failure(FetchFailure {
            parent_key: key.clone(),
            cause,
        })
    }
}
