//! # Query Controller
//!
//! Owns the aggregated collection and the last computed result.
//!
//! ```text
//!   Idle ──run──▶ Aggregating ──done──▶ Ready ──run──▶ Aggregating ...
//!                                       │   ▲
//!                                 rerun ▼   │ done
//!                                      Querying
//! ```
//!
//! Every [`run`](QueryController::run) and [`rerun`](QueryController::rerun)
//! takes a fresh sequence number. Only the holder of the newest number may
//! publish; anything older that finishes late gets
//! [`ControllerError::Superseded`] and leaves the published state alone.

use crate::aggregate::{AggregateError, Aggregator};
use crate::source::RecordSource;
use collate_core::{FetchFailure, ParentKey, QueryEngine, QueryResult, QuerySpec, SpecError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing aggregated yet.
    Idle,
    /// A run is fetching.
    Aggregating,
    /// A rerun is evaluating over the snapshot.
    Querying,
    /// A snapshot is available for queries.
    Ready,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("no aggregation has completed yet")]
    NotReady,
    #[error("run {generation} was superseded by run {latest}")]
    Superseded { generation: u64, latest: u64 },
}

/// The published state of the last winning run.
struct Snapshot<R> {
    parents: Vec<ParentKey>,
    records: Arc<Vec<R>>,
    failures: Vec<FetchFailure>,
    spec: QuerySpec,
    result: QueryResult<R>,
}

struct State<R> {
    phase: Phase,
    snapshot: Option<Snapshot<R>>,
}

pub struct QueryController<S: RecordSource> {
    aggregator: Aggregator<S>,
    engine: QueryEngine<S::Record>,
    /// Sequence number of the most recently started run.
    latest: AtomicU64,
    state: RwLock<State<S::Record>>,
}

impl<S> QueryController<S>
where
    S: RecordSource,
    S::Record: Clone,
{
    pub fn new(aggregator: Aggregator<S>, engine: QueryEngine<S::Record>) -> Self {
        Self {
            aggregator,
            engine,
            latest: AtomicU64::new(0),
            state: RwLock::new(State {
                phase: Phase::Idle,
                snapshot: None,
            }),
        }
    }

    pub fn aggregator(&self) -> &Aggregator<S> {
        &self.aggregator
    }

    pub fn engine(&self) -> &QueryEngine<S::Record> {
        &self.engine
    }

    /// Aggregate `parents` from scratch and evaluate `spec` over the result.
    pub async fn run(
        &self,
        parents: Vec<ParentKey>,
        spec: QuerySpec,
    ) -> Result<QueryResult<S::Record>, ControllerError> {
        spec.validate()?;
        let generation = {
            let mut state = self.state.write().await;
            state.phase = Phase::Aggregating;
            self.next_generation()
        };
        tracing::debug!("Run {} started over {} parents", generation, parents.len());

        let aggregation = match self.aggregator.aggregate(&parents).await {
            Ok(a) => a,
            Err(e) => {
                let mut state = self.state.write().await;
                if self.is_latest(generation) {
                    state.phase = if state.snapshot.is_some() {
                        Phase::Ready
                    } else {
                        Phase::Idle
                    };
                }
                return Err(e.into());
            }
        };

        let page = self.engine.execute(&aggregation.records, &spec)?;
        let result = QueryResult::from_page(page, aggregation.failures.clone(), generation);

        let mut state = self.state.write().await;
        let latest = self.latest.load(Ordering::SeqCst);
        if latest != generation {
            tracing::debug!("Run {} discarded, run {} is newer", generation, latest);
            return Err(ControllerError::Superseded { generation, latest });
        }
        state.snapshot = Some(Snapshot {
            parents,
            records: Arc::new(aggregation.records),
            failures: aggregation.failures,
            spec,
            result: result.clone(),
        });
        state.phase = Phase::Ready;
        tracing::info!(
            "Run {} ready: {} matched, {} failed parents",
            generation,
            result.total_matched,
            result.failures.len()
        );
        Ok(result)
    }

    /// Re-evaluate over the current snapshot without fetching. A rerun
    /// supersedes any run still in flight. When `spec` equals the last one
    /// the cached page is republished under the new sequence number.
    pub async fn rerun(&self, spec: QuerySpec) -> Result<QueryResult<S::Record>, ControllerError> {
        spec.validate()?;
        let (generation, records, failures) = {
            let mut state = self.state.write().await;
            let State { phase, snapshot } = &mut *state;
            let snapshot = snapshot.as_mut().ok_or(ControllerError::NotReady)?;
            let generation = self.next_generation();
            if snapshot.spec == spec {
                snapshot.result.generation = generation;
                *phase = Phase::Ready;
                return Ok(snapshot.result.clone());
            }
            *phase = Phase::Querying;
            (generation, snapshot.records.clone(), snapshot.failures.clone())
        };

        let evaluated = self.engine.execute(&records, &spec);

        let mut state = self.state.write().await;
        let latest = self.latest.load(Ordering::SeqCst);
        if latest != generation {
            tracing::debug!("Rerun {} discarded, run {} is newer", generation, latest);
            return Err(ControllerError::Superseded { generation, latest });
        }
        state.phase = Phase::Ready;
        let result = QueryResult::from_page(evaluated?, failures, generation);
        if let Some(snapshot) = state.snapshot.as_mut() {
            snapshot.spec = spec;
            snapshot.result = result.clone();
        }
        Ok(result)
    }

    /// Rerun when `parents` matches the current snapshot, otherwise run.
    pub async fn query(
        &self,
        parents: Vec<ParentKey>,
        spec: QuerySpec,
    ) -> Result<QueryResult<S::Record>, ControllerError> {
        let same_parents = {
            let state = self.state.read().await;
            state
                .snapshot
                .as_ref()
                .is_some_and(|s| s.parents == parents)
        };
        if same_parents {
            self.rerun(spec).await
        } else {
            self.run(parents, spec).await
        }
    }

    /// List the source's parents and run over all of them.
    pub async fn refresh_all(
        &self,
        spec: QuerySpec,
    ) -> Result<QueryResult<S::Record>, ControllerError> {
        let parents = self
            .aggregator
            .source()
            .list_parent_keys()
            .await
            .map_err(AggregateError::ListParents)?;
        self.run(parents, spec).await
    }

    /// The last published result, if any.
    pub async fn current(&self) -> Option<QueryResult<S::Record>> {
        let state = self.state.read().await;
        state.snapshot.as_ref().map(|s| s.result.clone())
    }

    /// The spec that produced [`current`](Self::current).
    pub async fn current_spec(&self) -> Option<QuerySpec> {
        let state = self.state.read().await;
        state.snapshot.as_ref().map(|s| s.spec.clone())
    }

    pub async fn phase(&self) -> Phase {
        self.state.read().await.phase
    }

    /// Parents of the published snapshot.
    pub async fn parents(&self) -> Vec<ParentKey> {
        let state = self.state.read().await;
        state
            .snapshot
            .as_ref()
            .map(|s| s.parents.clone())
            .unwrap_or_default()
    }

    /// Size of the aggregated collection behind the snapshot.
    pub async fn record_count(&self) -> usize {
        let state = self.state.read().await;
        state.snapshot.as_ref().map_or(0, |s| s.records.len())
    }

    /// Sequence number of the newest run or rerun started.
    pub fn latest_generation(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }

    fn next_generation(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_latest(&self, generation: u64) -> bool {
        self.latest.load(Ordering::SeqCst) == generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregatorConfig;
    use crate::source::{FnSource, SourceError};
    use collate_core::{Filter, PageSpec, Schema, SortKey, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Barrier;
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq)]
    struct Promo {
        store: String,
        title: String,
        discount: f64,
    }

    fn catalog(store: &str) -> Vec<Promo> {
        let n = store.len() as f64;
        vec![
            Promo {
                store: store.to_string(),
                title: format!("{} coffee", store),
                discount: n * 10.0,
            },
            Promo {
                store: store.to_string(),
                title: format!("{} books", store),
                discount: n,
            },
        ]
    }

    fn engine() -> QueryEngine<Promo> {
        QueryEngine::new(
            Schema::new()
                .searchable("title", |p: &Promo| Some(Value::from(p.title.as_str())))
                .field("store", |p: &Promo| Some(Value::from(p.store.as_str())))
                .field("discount", |p: &Promo| Some(Value::from(p.discount))),
        )
    }

    fn keys(raw: &[&str]) -> Vec<ParentKey> {
        raw.iter().map(|k| ParentKey::from(*k)).collect()
    }

    fn counting_controller(
        calls: Arc<AtomicUsize>,
    ) -> QueryController<impl RecordSource<Record = Promo>> {
        let source = FnSource::new(move |key: ParentKey| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if key.as_str() == "down" {
                    Err(SourceError::other("unreachable"))
                } else {
                    Ok(catalog(key.as_str()))
                }
            }
        });
        QueryController::new(Aggregator::new(source, AggregatorConfig::default()), engine())
    }

    #[tokio::test]
    async fn test_run_moves_idle_to_ready() {
        let ctl = counting_controller(Arc::new(AtomicUsize::new(0)));
        assert_eq!(ctl.phase().await, Phase::Idle);
        assert!(ctl.current().await.is_none());

        let result = ctl
            .run(keys(&["ab", "down", "c"]), QuerySpec::search("coffee"))
            .await
            .unwrap();
        assert_eq!(ctl.phase().await, Phase::Ready);
        assert_eq!(result.total_matched, 2);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].parent_key, ParentKey::from("down"));
        assert_eq!(result.generation, 1);
        assert_eq!(ctl.record_count().await, 4);
        assert_eq!(ctl.current().await, Some(result));
    }

    #[tokio::test]
    async fn test_rerun_does_not_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctl = counting_controller(calls.clone());
        ctl.run(keys(&["ab", "c"]), QuerySpec::default()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let spec = QuerySpec::default()
            .with_filter("store", Filter::Eq(Value::from("ab")))
            .with_sort(SortKey::desc("discount"))
            .with_page(PageSpec::Indexed { index: 0, size: 1 });
        let result = ctl.rerun(spec.clone()).await.unwrap();
        assert_eq!(result.items[0].title, "ab coffee");
        assert_eq!(result.total_matched, 2);
        assert!(result.has_more);
        assert_eq!(result.generation, 2);

        let again = ctl.rerun(spec).await.unwrap();
        assert_eq!(again.items, result.items);
        assert_eq!(again.generation, 3);
        assert_eq!(ctl.current().await, Some(again));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_query_reuses_snapshot_for_same_parents() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctl = counting_controller(calls.clone());
        ctl.query(keys(&["ab"]), QuerySpec::default()).await.unwrap();
        ctl.query(keys(&["ab"]), QuerySpec::search("books")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        ctl.query(keys(&["ab", "c"]), QuerySpec::default()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(ctl.parents().await, keys(&["ab", "c"]));
    }

    #[tokio::test]
    async fn test_rerun_before_run_is_not_ready() {
        let ctl = counting_controller(Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            ctl.rerun(QuerySpec::default()).await,
            Err(ControllerError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected_before_fetching() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctl = counting_controller(calls.clone());
        let bad = QuerySpec::default().with_page(PageSpec::Indexed { index: 0, size: 0 });
        assert!(matches!(
            ctl.run(keys(&["ab"]), bad).await,
            Err(ControllerError::Spec(SpecError::ZeroPageSize))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctl.phase().await, Phase::Idle);
    }

    #[tokio::test]
    async fn test_duplicate_parents_keep_previous_snapshot() {
        let ctl = counting_controller(Arc::new(AtomicUsize::new(0)));
        ctl.run(keys(&["ab"]), QuerySpec::default()).await.unwrap();
        let err = ctl
            .run(keys(&["c", "c"]), QuerySpec::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Aggregate(AggregateError::DuplicateParentKey(_))
        ));
        assert_eq!(ctl.phase().await, Phase::Ready);
        assert_eq!(ctl.parents().await, keys(&["ab"]));
    }

    /// A controller whose "slow" parent blocks until `release` fires.
    fn gated_controller() -> (
        Arc<QueryController<impl RecordSource<Record = Promo>>>,
        Arc<Notify>,
        Arc<Notify>,
    ) {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let source = {
            let (started, release) = (started.clone(), release.clone());
            FnSource::new(move |key: ParentKey| {
                let (started, release) = (started.clone(), release.clone());
                async move {
                    if key.as_str() == "slow" {
                        started.notify_one();
                        release.notified().await;
                    }
                    Ok::<_, SourceError>(catalog(key.as_str()))
                }
            })
        };
        let ctl = Arc::new(QueryController::new(
            Aggregator::new(source, AggregatorConfig::default()),
            engine(),
        ));
        (ctl, started, release)
    }

    #[tokio::test]
    async fn test_late_run_is_superseded() {
        let (ctl, started, release) = gated_controller();

        let first = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.run(keys(&["slow"]), QuerySpec::default()).await }
        });
        started.notified().await;
        assert_eq!(ctl.phase().await, Phase::Aggregating);

        let second = ctl.run(keys(&["fast"]), QuerySpec::default()).await.unwrap();
        assert_eq!(second.generation, 2);

        release.notify_one();
        let late = first.await.unwrap();
        assert!(matches!(
            late,
            Err(ControllerError::Superseded {
                generation: 1,
                latest: 2
            })
        ));

        let current = ctl.current().await.unwrap();
        assert_eq!(current.generation, 2);
        assert!(current.items.iter().all(|p| p.store == "fast"));
        assert_eq!(ctl.phase().await, Phase::Ready);
    }

    #[tokio::test]
    async fn test_rerun_supersedes_outstanding_run() {
        let (ctl, started, release) = gated_controller();
        ctl.run(keys(&["fast"]), QuerySpec::default()).await.unwrap();

        let slow = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.run(keys(&["slow"]), QuerySpec::default()).await }
        });
        started.notified().await;
        assert_eq!(ctl.phase().await, Phase::Aggregating);

        let books = ctl.rerun(QuerySpec::search("books")).await.unwrap();
        assert_eq!(books.generation, 3);
        let titles: Vec<&str> = books.items.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["fast books"]);

        release.notify_one();
        let late = slow.await.unwrap();
        assert!(matches!(
            late,
            Err(ControllerError::Superseded {
                generation: 2,
                latest: 3
            })
        ));

        assert_eq!(ctl.current().await, Some(books));
        assert_eq!(ctl.current_spec().await, Some(QuerySpec::search("books")));
        assert_eq!(ctl.parents().await, keys(&["fast"]));
        assert_eq!(ctl.phase().await, Phase::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rerun_reports_querying_while_evaluating() {
        let armed = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(Barrier::new(2));
        let schema = Schema::new().field("discount", {
            let (armed, gate) = (armed.clone(), gate.clone());
            move |p: &Promo| {
                if armed.swap(false, Ordering::SeqCst) {
                    gate.wait();
                    gate.wait();
                }
                Some(Value::from(p.discount))
            }
        });
        let source = FnSource::new(|key: ParentKey| async move {
            Ok::<_, SourceError>(catalog(key.as_str()))
        });
        let ctl = Arc::new(QueryController::new(
            Aggregator::new(source, AggregatorConfig::default()),
            QueryEngine::new(schema),
        ));
        ctl.run(keys(&["ab"]), QuerySpec::default()).await.unwrap();

        armed.store(true, Ordering::SeqCst);
        let rerun = tokio::spawn({
            let ctl = ctl.clone();
            async move {
                ctl.rerun(QuerySpec::default().with_sort(SortKey::desc("discount")))
                    .await
            }
        });
        let meet = |gate: Arc<Barrier>| {
            tokio::task::spawn_blocking(move || {
                gate.wait();
            })
        };
        meet(gate.clone()).await.unwrap();
        assert_eq!(ctl.phase().await, Phase::Querying);
        meet(gate.clone()).await.unwrap();

        let result = rerun.await.unwrap().unwrap();
        assert_eq!(result.items[0].title, "ab coffee");
        assert_eq!(ctl.phase().await, Phase::Ready);
    }

    #[tokio::test]
    async fn test_refresh_all_lists_parents() {
        let source = FnSource::new(|key: ParentKey| async move {
            Ok::<_, SourceError>(catalog(key.as_str()))
        })
        .with_parents(["x", "yy"]);
        let ctl = QueryController::new(
            Aggregator::new(source, AggregatorConfig::default()),
            engine(),
        );
        let result = ctl
            .refresh_all(QuerySpec::default().with_sort(SortKey::asc("discount")))
            .await
            .unwrap();
        let discounts: Vec<f64> = result.items.iter().map(|p| p.discount).collect();
        assert_eq!(discounts, vec![1.0, 2.0, 10.0, 20.0]);
        assert_eq!(ctl.parents().await, keys(&["x", "yy"]));
    }
}
