//! Operator HTTP surface.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use actuator_core::execution::{
    AdaptiveRouteSnapshot, CircuitEvent, DlqState, ExecutionRuntime, Intent, Job, JobHandle,
    JobId, QueueDepth, ReservationDelta, SlaStats, WindowSnapshot, WorkerHeartbeat,
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::errors::{AppError, AppResult};

const DEFAULT_DLQ_LIMIT: usize = 50;
const MAX_DLQ_LIMIT: usize = 500;

#[derive(Clone, Debug)]
pub struct AppState {
    pub runtime: Arc<ExecutionRuntime>,
}

impl AppState {
    pub fn new(runtime: Arc<ExecutionRuntime>) -> Self {
        Self { runtime }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/jobs", post(enqueue_job))
        .route("/v1/jobs/{id}", get(get_job))
        .route("/v1/dlq", get(list_dlq))
        .route("/v1/dlq/{id}/replay", post(replay_dlq))
        .route("/v1/dlq/{id}/resolve", post(resolve_dlq))
        .route("/v1/metrics/queue", get(queue_metrics))
        .route("/v1/circuits/events", get(circuit_events))
        .route("/v1/rate-limits", get(rate_limits))
        .route("/v1/workers", get(workers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn parse_job_id(raw: &str) -> AppResult<JobId> {
    JobId::from_str(raw).map_err(|_| AppError::bad_request(format!("invalid job id: {raw}")))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub intent: Intent,
    #[serde(default)]
    pub context_key: Option<String>,
    #[serde(default)]
    pub priority: Option<f64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub reservation_delta: Option<ReservationDelta>,
    #[serde(default)]
    pub available_at: Option<DateTime<Utc>>,
}

async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> AppResult<(StatusCode, Json<JobHandle>)> {
    let mut job = state.runtime.new_job(request.intent);
    if let Some(context_key) = request.context_key {
        job = job.with_context(context_key);
    }
    if let Some(priority) = request.priority {
        job = job.with_priority(priority);
    }
    if let Some(max_attempts) = request.max_attempts {
        job = job.with_max_attempts(max_attempts);
    }
    if let Some(delta) = request.reservation_delta {
        job.reservation_delta = delta;
    }
    if let Some(at) = request.available_at {
        job = job.available_from(at);
    }

    let handle = state.runtime.enqueue(job).await?;
    let status = if handle.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(handle)))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Job>> {
    let job_id = parse_job_id(&id)?;
    state
        .runtime
        .get(job_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("job {job_id}")))
}

#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    pub limit: Option<usize>,
}

async fn list_dlq(
    State(state): State<AppState>,
    Query(query): Query<DlqQuery>,
) -> AppResult<Json<Vec<Job>>> {
    let limit = query.limit.unwrap_or(DEFAULT_DLQ_LIMIT).min(MAX_DLQ_LIMIT);
    Ok(Json(state.runtime.list_dlq(limit).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplayRequest {
    #[serde(default)]
    pub actor: Option<String>,
}

fn actor_or_default(actor: Option<String>) -> String {
    actor
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| "operator".to_string())
}

async fn replay_dlq(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> AppResult<Json<JobHandle>> {
    let job_id = parse_job_id(&id)?;
    // The body is optional for replays.
    let request: ReplayRequest = if body.is_empty() {
        ReplayRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::bad_request(format!("invalid replay request: {e}")))?
    };
    let actor = actor_or_default(request.actor);
    Ok(Json(state.runtime.replay_dlq(job_id, &actor).await?))
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    #[serde(default)]
    pub actor: Option<String>,
    pub state: DlqState,
}

async fn resolve_dlq(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> AppResult<Json<Job>> {
    let job_id = parse_job_id(&id)?;
    let actor = actor_or_default(request.actor);
    Ok(Json(
        state
            .runtime
            .resolve_dlq(job_id, &actor, request.state)
            .await?,
    ))
}

#[derive(Debug, Serialize)]
pub struct QueueMetrics {
    pub depth: QueueDepth,
    pub depth_by_context: BTreeMap<String, usize>,
    pub inbox_depth: usize,
    pub sla: SlaStats,
}

async fn queue_metrics(State(state): State<AppState>) -> AppResult<Json<QueueMetrics>> {
    let runtime = &state.runtime;
    Ok(Json(QueueMetrics {
        depth: runtime.depth().await?,
        depth_by_context: runtime.depth_by_context().await?,
        inbox_depth: runtime.inbox_depth().await?,
        sla: runtime.sla_stats(),
    }))
}

async fn circuit_events(State(state): State<AppState>) -> Json<Vec<CircuitEvent>> {
    Json(state.runtime.drain_circuit_events().await)
}

#[derive(Debug, Serialize)]
pub struct RateLimitView {
    pub windows: Vec<WindowSnapshot>,
    pub adaptive: Vec<AdaptiveRouteSnapshot>,
}

async fn rate_limits(State(state): State<AppState>) -> Json<RateLimitView> {
    Json(RateLimitView {
        windows: state.runtime.rate_limit_snapshot(),
        adaptive: state.runtime.adaptive_snapshot(),
    })
}

async fn workers(State(state): State<AppState>) -> AppResult<Json<Vec<WorkerHeartbeat>>> {
    Ok(Json(state.runtime.worker_heartbeats().await?))
}

#[cfg(test)]
mod tests {
    use actuator_core::execution::ExecutionConfig;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::adapters::{DryRunAdapter, LoggingResultApplier};

    fn app() -> (Router, Arc<ExecutionRuntime>) {
        let runtime = ExecutionRuntime::builder(ExecutionConfig::default())
            .with_adapter("x", Arc::new(DryRunAdapter::new("x")))
            .with_applier(Arc::new(LoggingResultApplier::default()))
            .build()
            .unwrap();
        let runtime = Arc::new(runtime);
        (router(AppState::new(Arc::clone(&runtime))), runtime)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _) = app();
        let (status, body) = send(&app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn enqueue_then_fetch_and_merge_duplicate() {
        let (app, _) = app();
        let request = json!({
            "intent": {
                "intent_id": "intent-1",
                "platform": "x",
                "target": "acct-1",
                "action": "post",
                "payload": {"text": "hello"}
            },
            "context_key": "campaign-7",
            "priority": 3.0
        });

        let (status, first) = send(&app, post_json("/v1/jobs", request.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(first["accepted"], true);

        let (status, second) = send(&app, post_json("/v1/jobs", request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["merged_into"], first["job_id"]);

        let job_id = first["job_id"].as_str().unwrap();
        let (status, job) = send(&app, get_req(&format!("/v1/jobs/{job_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["state"], "queued");
        assert_eq!(job["context_key"], "campaign-7");

        let (status, metrics) = send(&app, get_req("/v1/metrics/queue")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(metrics["depth"]["queued"], 1);
        assert_eq!(metrics["depth_by_context"]["campaign-7"], 1);
    }

    #[tokio::test]
    async fn invalid_and_unknown_ids_map_to_client_errors() {
        let (app, _) = app();
        let (status, _) = send(&app, get_req("/v1/jobs/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unknown = JobId::new();
        let (status, body) = send(&app, get_req(&format!("/v1/jobs/{unknown}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["status"], 404);

        let (status, _) = send(
            &app,
            post_json(&format!("/v1/dlq/{unknown}/replay"), json!({"actor": "ops"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_enqueue_is_a_bad_request() {
        let (app, _) = app();
        let request = json!({
            "intent": {
                "intent_id": "intent-2",
                "platform": "x",
                "target": "acct-1",
                "action": "post"
            },
            "max_attempts": 0
        });
        let (status, body) = send(&app, post_json("/v1/jobs", request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["status"], 400);

        let (status, metrics) = send(&app, get_req("/v1/metrics/queue")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(metrics["depth"]["queued"], 0);
    }

    #[tokio::test]
    async fn resolving_a_non_dlq_job_conflicts() {
        let (app, runtime) = app();
        let handle = runtime
            .enqueue(runtime.new_job(Intent::new("intent-2", "x", "acct-1", "post")))
            .await
            .unwrap();
        let (status, _) = send(
            &app,
            post_json(
                &format!("/v1/dlq/{}/resolve", handle.job_id),
                json!({"actor": "ops", "state": "resolved"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn telemetry_endpoints_respond() {
        let (app, _) = app();
        for uri in ["/v1/dlq", "/v1/circuits/events", "/v1/rate-limits", "/v1/workers"] {
            let (status, _) = send(&app, get_req(uri)).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
        }
    }
}
