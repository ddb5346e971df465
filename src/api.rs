use crate::error::{ApiError, ApiResult};
use crate::failures::Aggregator;
use crate::loader::{LoadStatus, TaskId};
use crate::models::{JobId, StoredBuild, TestName, WorkflowId};
use crate::state::AppState;
use crate::test_failure::{TestFailure, UpstreamFailures};
use crate::trends::{TrendData, UpstreamTrends, WorkflowVersionData};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/ci/load", post(submit_load))
        .route("/api/ci/load/status", get(all_load_status))
        .route("/api/ci/load/status/:task_id", get(load_status))
        .route("/api/ci/upstream/refresh", post(refresh_upstream))
        .route("/api/ci/builds/last", get(last_build))
        .route("/api/ci/failures", get(test_failure))
        .route("/api/upstream/trends", get(upstream_trends))
        .route("/api/upstream/failures", get(upstream_failures))
        .with_state(state)
}

#[derive(Deserialize, Clone, Debug)]
pub struct LoadRequest {
    workflow: String,
    branch: String,
    max_builds: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct LoadResponse {
    pub task_id: TaskId,
}

#[derive(Deserialize, Clone, Debug)]
pub struct JobQuery {
    workflow: String,
    branch: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct FailureQuery {
    workflow: String,
    suite: String,
    test: String,
    /// Only runs of the last `days` count as analyzed.
    days: Option<i64>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct UpstreamFailuresQuery {
    /// Every configured upstream workflow when absent.
    workflow: Option<String>,
    days: Option<i64>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TrendsQuery {
    /// Comma separated branch names; every configured branch when absent.
    versions: Option<String>,
}

async fn submit_load(
    State(state): State<AppState>,
    Json(req): Json<LoadRequest>,
) -> ApiResult<(StatusCode, Json<LoadResponse>)> {
    let job = JobId::new(&req.workflow, &req.branch)?;
    let task_id = match req.max_builds {
        Some(0) => return Err(ApiError::InvalidInput("max_builds must be positive".into())),
        Some(max) => state.loader.submit_load(job, max),
        None => state.loader.submit_default(job),
    };
    Ok((StatusCode::ACCEPTED, Json(LoadResponse { task_id })))
}

async fn all_load_status(State(state): State<AppState>) -> Json<Vec<LoadStatus>> {
    Json(state.loader.all_status())
}

async fn load_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<LoadStatus>> {
    let id = TaskId::parse_str(&task_id)?;
    state
        .loader
        .task_status(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Task {}", id)))
}

async fn refresh_upstream(State(state): State<AppState>) -> Json<&'static str> {
    info!("upstream refresh requested");
    state.refresh_notify.notify_one();
    Json("upstream refresh triggered")
}

async fn job_db_id(state: &AppState, job: &JobId) -> ApiResult<i64> {
    state
        .store
        .job_db_id(job)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {}", job)))
}

async fn last_build(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> ApiResult<Json<StoredBuild>> {
    let job = JobId::new(&query.workflow, &query.branch)?;
    let job_db_id = job_db_id(&state, &job).await?;
    state
        .store
        .recent_of(job_db_id, 1)
        .await?
        .into_iter()
        .next()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Build of {}", job)))
}

async fn test_failure(
    State(state): State<AppState>,
    Query(query): Query<FailureQuery>,
) -> ApiResult<Json<TestFailure>> {
    let workflow = WorkflowId::new(&query.workflow)?;
    let test = TestName::of_suite_and_test(&query.suite, &query.test)?;

    let history = state
        .store
        .test_history(&workflow, &test)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("History of {} in {}", test, workflow)))?;
    let details = Aggregator::new(state.config.trends.malformed_records).aggregate(&history)?;
    if details.malformed() > 0 {
        warn!(%workflow, %test, malformed = details.malformed(), "skipped malformed run records");
    }

    let window_start = query.days.map(|days| Utc::now() - Duration::days(days));
    Ok(Json(TestFailure::build_in_window(
        test,
        details.into_runs(),
        &workflow,
        window_start,
    )))
}

async fn upstream_failures(
    State(state): State<AppState>,
    Query(query): Query<UpstreamFailuresQuery>,
) -> ApiResult<Json<UpstreamFailures>> {
    let workflows = match &query.workflow {
        Some(name) => vec![WorkflowId::new(name)?],
        None => {
            let mut workflows = Vec::new();
            for upstream in &state.config.upstream.jobs {
                let workflow = WorkflowId::new(&upstream.workflow)?;
                if !workflows.contains(&workflow) {
                    workflows.push(workflow);
                }
            }
            workflows
        }
    };
    let since = Utc::now() - Duration::days(query.days.unwrap_or(state.config.trends.days));
    let aggregator = Aggregator::new(state.config.trends.malformed_records);

    let mut failures = Vec::new();
    for workflow in &workflows {
        for (test, history) in state.store.failure_histories(workflow, since).await? {
            let details = aggregator.aggregate(&history)?;
            if details.malformed() > 0 {
                warn!(%workflow, %test, malformed = details.malformed(), "skipped malformed run records");
            }
            failures.push(TestFailure::build_in_window(
                test,
                details.into_runs(),
                workflow,
                Some(since),
            ));
        }
    }
    info!("Upstream failures board has {} tests", failures.len());
    Ok(Json(UpstreamFailures::new(failures)))
}

async fn upstream_trends(
    State(state): State<AppState>,
    Query(query): Query<TrendsQuery>,
) -> ApiResult<Json<JsonValue>> {
    let versions: Option<Vec<String>> = query.versions.as_deref().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    });

    let key = format!("trends:{:?}", versions);
    if let Some(cached) = state.cache.get(&key) {
        return Ok(Json(cached));
    }

    let trends = build_upstream_trends(&state, versions.as_deref()).await?;
    let val = serde_json::to_value(&trends).map_err(anyhow::Error::from)?;
    state.cache.insert(key, val.clone()).await;
    Ok(Json(val))
}

/// Trends of every configured upstream job whose branch is among `versions`.
async fn build_upstream_trends(
    state: &AppState,
    versions: Option<&[String]>,
) -> ApiResult<UpstreamTrends> {
    let trends_config = &state.config.trends;
    let since = Utc::now() - Duration::days(trends_config.days);
    let mut entries = Vec::new();

    for upstream in &state.config.upstream.jobs {
        let workflow = WorkflowId::new(&upstream.workflow)?;
        for branch in &upstream.branches {
            if versions.is_some_and(|v| !v.contains(branch)) {
                continue;
            }
            let job = JobId::new(&upstream.workflow, branch)?;
            let Some(job_db_id) = state.store.job_db_id(&job).await? else {
                continue;
            };
            let builds = state.store.usable_since(job_db_id, since).await?;
            entries.push(WorkflowVersionData {
                version: job.branch.version(),
                workflow: workflow.clone(),
                data: TrendData::from_builds(&builds, trends_config.recent_builds),
            });
        }
    }
    Ok(UpstreamTrends::build(entries))
}
