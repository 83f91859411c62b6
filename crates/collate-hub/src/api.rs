//! # API Handlers
//!
//! Axum handlers over the shared [`QueryController`](collate_io::QueryController).

use crate::{ApiError, AppState};
use axum::{extract::State, http::StatusCode, Json};
use collate_core::{JsonRecord, ParentKey, QueryResult, QuerySpec};
use collate_io::{AggregateError, ControllerError, Phase, RecordSource};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn error_response(e: ControllerError) -> (StatusCode, Json<ApiError>) {
    let status = match &e {
        ControllerError::Spec(_) => StatusCode::BAD_REQUEST,
        ControllerError::Aggregate(AggregateError::DuplicateParentKey(_)) => StatusCode::BAD_REQUEST,
        ControllerError::Aggregate(AggregateError::ListParents(_)) => StatusCode::BAD_GATEWAY,
        ControllerError::NotReady | ControllerError::Superseded { .. } => StatusCode::CONFLICT,
    };
    (status, Json(ApiError::new(e.to_string())))
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub phase: Phase,
    /// Newest run started.
    pub generation: u64,
    /// Run behind the published result, if any.
    pub published_generation: Option<u64>,
    pub parents: usize,
    pub records: usize,
    pub failures: usize,
    pub source: String,
    pub started_at: String,
    pub uptime_secs: u64,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let controller = &state.controller;
    let current = controller.current().await;
    Json(StatusResponse {
        phase: controller.phase().await,
        generation: controller.latest_generation(),
        published_generation: current.as_ref().map(|r| r.generation),
        parents: controller.parents().await.len(),
        records: controller.record_count().await,
        failures: current.as_ref().map_or(0, |r| r.failures.len()),
        source: controller.aggregator().source().name().to_string(),
        started_at: state.started_at.to_rfc3339(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

// =============================================================================
// Parents
// =============================================================================

pub async fn list_parents(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ParentKey>> {
    state
        .controller
        .aggregator()
        .source()
        .list_parent_keys()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::BAD_GATEWAY, Json(ApiError::new(e.to_string()))))
}

// =============================================================================
// Query
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct QueryRequest {
    /// Query DSL text.
    #[serde(default)]
    pub query: Option<String>,
    /// A spec in JSON form; wins over `query`.
    #[serde(default)]
    pub structured: Option<QuerySpec>,
    /// Re-aggregate before evaluating.
    #[serde(default)]
    pub refresh: bool,
}

pub async fn execute_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<QueryResult<JsonRecord>> {
    let spec = if let Some(spec) = req.structured {
        spec
    } else if let Some(text) = &req.query {
        collate_core::parse(text)
            .map_err(|e| (StatusCode::BAD_REQUEST, Json(ApiError::new(e.to_string()))))?
    } else {
        return Err((StatusCode::BAD_REQUEST, Json(ApiError::new("Missing query"))));
    };

    let result = if req.refresh {
        state.controller.refresh_all(spec).await
    } else {
        state.query_or_warm_up(spec).await
    };
    result.map(Json).map_err(error_response)
}

/// Re-aggregate every parent, keeping the current spec (the default spec
/// before the first run).
pub async fn refresh(State(state): State<Arc<AppState>>) -> ApiResult<QueryResult<JsonRecord>> {
    let spec = state.controller.current_spec().await.unwrap_or_default();
    state
        .controller
        .refresh_all(spec)
        .await
        .map(Json)
        .map_err(error_response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DynSource;
    use collate_core::{FieldKind, FieldSpec, PageSpec, QueryEngine, Schema};
    use collate_io::{Aggregator, AggregatorConfig, FnSource, QueryController, SourceError};
    use serde_json::json;

    fn state() -> Arc<AppState> {
        let source: DynSource = Arc::new(
            FnSource::new(|key: ParentKey| async move {
                tokio::task::yield_now().await;
                match key.as_str() {
                    "closed" => Err(SourceError::other("store closed")),
                    k => Ok(vec![
                        JsonRecord(json!({ "title": format!("{} latte", k), "discount": 10 })),
                        JsonRecord(json!({ "title": format!("{} muffin", k), "discount": 25 })),
                    ]),
                }
            })
            .with_parents(["north", "closed", "south"]),
        );
        let schema = Schema::from_specs(&[
            FieldSpec::new("title", FieldKind::Text).searchable(),
            FieldSpec::new("discount", FieldKind::Number),
        ])
        .unwrap();
        let controller = QueryController::new(
            Aggregator::new(source, AggregatorConfig::default()),
            QueryEngine::new(schema),
        );
        Arc::new(AppState::new(controller))
    }

    fn dsl(text: &str) -> Json<QueryRequest> {
        Json(QueryRequest {
            query: Some(text.to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_first_query_aggregates() {
        let state = state();
        let Json(result) = execute_query(
            State(state.clone()),
            dsl("SEARCH latte ORDER BY title DESC"),
        )
        .await
        .unwrap();
        assert_eq!(result.total_matched, 2);
        assert_eq!(result.items[0].lookup("title"), Some(&json!("south latte")));
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].parent_key, ParentKey::from("closed"));

        let Json(status) = status(State(state)).await;
        assert_eq!(status.phase, Phase::Ready);
        assert_eq!(status.records, 4);
        assert_eq!(status.parents, 3);
        assert_eq!(status.published_generation, Some(1));
    }

    #[tokio::test]
    async fn test_followup_query_does_not_reaggregate() {
        let state = state();
        execute_query(State(state.clone()), dsl("SEARCH latte"))
            .await
            .unwrap();
        let Json(result) = execute_query(State(state.clone()), dsl("WHERE discount >= 20"))
            .await
            .unwrap();
        assert_eq!(result.total_matched, 2);
        assert_eq!(result.generation, 2);
        assert_eq!(state.controller.latest_generation(), 2);
        assert_eq!(state.controller.record_count().await, 4);
    }

    #[tokio::test]
    async fn test_concurrent_first_queries_share_one_aggregation() {
        let state = state();
        let (a, b) = tokio::join!(
            execute_query(State(state.clone()), dsl("SEARCH latte")),
            execute_query(State(state.clone()), dsl("SEARCH muffin")),
        );
        let Json(a) = a.unwrap();
        let Json(b) = b.unwrap();
        assert_eq!(a.generation, 1);
        assert_eq!(b.generation, 2);
        assert_eq!(b.total_matched, 2);
    }

    #[tokio::test]
    async fn test_warm_up_skips_when_a_query_got_there_first() {
        let state = state();
        let (query, warm) = tokio::join!(
            execute_query(State(state.clone()), dsl("SEARCH latte")),
            state.warm_up(),
        );
        assert_eq!(query.unwrap().0.generation, 1);
        warm.unwrap();
        assert_eq!(state.controller.latest_generation(), 1);

        state.warm_up().await.unwrap();
        assert_eq!(state.controller.latest_generation(), 1);
    }

    #[tokio::test]
    async fn test_structured_spec_and_refresh() {
        let state = state();
        let req = QueryRequest {
            structured: Some(QuerySpec::default().with_page(PageSpec::Reveal { visible_count: 1 })),
            refresh: true,
            ..Default::default()
        };
        let Json(result) = execute_query(State(state.clone()), Json(req)).await.unwrap();
        assert_eq!(result.items.len(), 1);
        assert!(result.has_more);

        let Json(again) = refresh(State(state)).await.unwrap();
        assert_eq!(again.generation, 2);
        assert_eq!(again.items.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_queries_are_400() {
        let state = state();
        let (code, _) = execute_query(State(state.clone()), dsl("WHERE discount > 3"))
            .await
            .unwrap_err();
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, _) = execute_query(State(state.clone()), dsl("SIZE 0"))
            .await
            .unwrap_err();
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, _) = execute_query(State(state), Json(QueryRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(code, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_parents() {
        let Json(parents) = list_parents(State(state())).await.unwrap();
        assert_eq!(parents.len(), 3);
        assert_eq!(parents[0], ParentKey::from("north"));
    }

    #[test]
    fn test_error_mapping() {
        let (code, _) = error_response(ControllerError::Superseded {
            generation: 1,
            latest: 2,
        });
        assert_eq!(code, StatusCode::CONFLICT);
        let (code, _) = error_response(ControllerError::Aggregate(AggregateError::ListParents(
            SourceError::Unsupported,
        )));
        assert_eq!(code, StatusCode::BAD_GATEWAY);
    }
}
