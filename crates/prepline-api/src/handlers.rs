//! REST API handlers.
//!
//! Every response uses the same envelope: `{success, data}` on success and
//! `{success: false, error: {code, message}}` on failure.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use prepline_registry::RegistryError;
use prepline_router::{PlacementRequest, RouterError};
use prepline_state::{
    ExecutionMode, FunctionProfile, FunctionStats, FunctionStatus, Heartbeat, NodeSpec, PoolType,
    Priority, RouterDecision, WarmStatus,
};

use crate::ApiState;
use crate::metrics::{MetricsSnapshot, render_prometheus};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;
const DEFAULT_MINUTES: u32 = 60;
const MAX_MINUTES: u32 = 24 * 60;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }),
    )
        .into_response()
}

fn router_error(e: &RouterError) -> Response {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, e.code(), &e.to_string())
}

fn registry_error(e: &RegistryError) -> Response {
    let (status, code) = match e {
        RegistryError::NodeNotFound(_) => (StatusCode::NOT_FOUND, "NODE_NOT_FOUND"),
        RegistryError::InvalidNodeState { .. } => (StatusCode::BAD_REQUEST, "INVALID_NODE_STATE"),
        RegistryError::NodeFull(_) | RegistryError::NodeUnavailable(_) => {
            (StatusCode::CONFLICT, "NODE_UNAVAILABLE")
        }
        RegistryError::LockTimeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "LOCK_TIMEOUT"),
    };
    error_response(status, code, &e.to_string())
}

fn lookup(state: &ApiState, function_id: &str) -> Result<FunctionProfile, Response> {
    state
        .router
        .deps()
        .directory
        .get_function_profile(function_id)
        .ok_or_else(|| router_error(&RouterError::UnknownFunction(function_id.to_string())))
}

/// `?pool=` if present, else the function's preferred pool.
fn pool_or_preferred(pool: Option<&str>, profile: &FunctionProfile) -> Result<PoolType, Response> {
    match pool {
        None => Ok(profile.pool_type),
        Some(raw) => raw
            .parse::<PoolType>()
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, "INVALID_POOL", &e.to_string())),
    }
}

// ── Placement ──────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InvokeRequest {
    pub priority: Option<Priority>,
    /// Opaque invocation arguments; carried to the node, not inspected.
    pub args: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct InvokeResponse {
    pub mode: ExecutionMode,
    pub decision: RouterDecision,
}

/// POST /api/v1/functions/{id}/invoke
pub async fn invoke(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<InvokeRequest>,
) -> Response {
    let request = PlacementRequest {
        function_id: id,
        priority: req.priority,
    };
    match state.router.submit(request).await {
        Ok(placement) => ApiResponse::ok(InvokeResponse {
            mode: placement.mode,
            decision: placement.decision,
        })
        .into_response(),
        Err(e) => router_error(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub function_id: String,
    pub node_id: String,
    pub duration_ms: f64,
    pub success: bool,
}

/// POST /api/v1/completions
pub async fn complete(State(state): State<ApiState>, Json(req): Json<CompletionRequest>) -> Response {
    match state
        .router
        .complete(&req.function_id, &req.node_id, req.duration_ms, req.success)
    {
        Ok(()) => ApiResponse::ok("recorded").into_response(),
        Err(e) => router_error(&e),
    }
}

// ── Functions ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct FunctionView {
    pub profile: FunctionProfile,
    pub stats: FunctionStats,
    pub status: FunctionStatus,
    pub warm: WarmStatus,
}

/// GET /api/v1/functions/{id}
pub async fn get_function(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let profile = match lookup(&state, &id) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let observer = &state.router.deps().observer;
    let view = FunctionView {
        stats: observer.current_stats(&id),
        status: observer.status(&id),
        warm: state.scheduler.warm_status(&id, profile.pool_type),
        profile,
    };
    ApiResponse::ok(view).into_response()
}

/// GET /api/v1/functions/{id}/decisions/latest
pub async fn latest_decision(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.router.deps().log.latest_decision(&id) {
        Some(entry) => ApiResponse::ok(entry).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "no decisions recorded"),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/functions/{id}/decisions?limit=
pub async fn decision_history(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
    ApiResponse::ok(state.router.deps().log.decision_history(&id, limit)).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct PoolQuery {
    pub pool: Option<String>,
}

/// GET /api/v1/functions/{id}/warm?pool=
pub async fn warm_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(q): Query<PoolQuery>,
) -> Response {
    let pool = match lookup(&state, &id).and_then(|p| pool_or_preferred(q.pool.as_deref(), &p)) {
        Ok(pool) => pool,
        Err(resp) => return resp,
    };
    ApiResponse::ok(state.scheduler.warm_status(&id, pool)).into_response()
}

/// GET /api/v1/functions/{id}/timeline?pool=
pub async fn timeline(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(q): Query<PoolQuery>,
) -> Response {
    let pool = match lookup(&state, &id).and_then(|p| pool_or_preferred(q.pool.as_deref(), &p)) {
        Ok(pool) => pool,
        Err(resp) => return resp,
    };
    ApiResponse::ok(state.scheduler.timeline(&id, pool)).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct PredictionQuery {
    pub horizon: Option<u32>,
    pub lookback: Option<u32>,
}

/// GET /api/v1/functions/{id}/prediction?horizon=&lookback=
pub async fn prediction(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(q): Query<PredictionQuery>,
) -> Response {
    if let Err(resp) = lookup(&state, &id) {
        return resp;
    }
    let horizon = q.horizon.unwrap_or(DEFAULT_MINUTES).min(MAX_MINUTES);
    let lookback = q.lookback.unwrap_or(DEFAULT_MINUTES).min(MAX_MINUTES);
    ApiResponse::ok(state.router.deps().sizer.prediction(&id, lookback, horizon)).into_response()
}

/// GET /api/v1/functions/{id}/heatmap
pub async fn heatmap(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    if let Err(resp) = lookup(&state, &id) {
        return resp;
    }
    ApiResponse::ok(state.predictor.heatmap(&id)).into_response()
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.router.deps().registry.list_nodes()).into_response()
}

/// Registration body; the pool arrives as free text and is validated here.
#[derive(Debug, Deserialize)]
pub struct RegisterNodeRequest {
    pub node_id: String,
    pub pool_type: String,
    pub free_cpu_percent: f64,
    pub free_mem_gib: f64,
    pub max_running: u32,
}

/// POST /api/v1/nodes
pub async fn register_node(State(state): State<ApiState>, Json(req): Json<RegisterNodeRequest>) -> Response {
    let pool_type = match req.pool_type.parse::<PoolType>() {
        Ok(pool) => pool,
        Err(e) => {
            return registry_error(&RegistryError::InvalidNodeState {
                node_id: req.node_id,
                reason: e.to_string(),
            });
        }
    };
    let spec = NodeSpec {
        node_id: req.node_id,
        pool_type,
        free_cpu_percent: req.free_cpu_percent,
        free_mem_gib: req.free_mem_gib,
        max_running: req.max_running,
    };
    match state.router.deps().registry.register(spec) {
        Ok(snapshot) => (StatusCode::CREATED, ApiResponse::ok(snapshot)).into_response(),
        Err(e) => registry_error(&e),
    }
}

/// POST /api/v1/nodes/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(hb): Json<Heartbeat>,
) -> Response {
    match state.router.deps().registry.heartbeat(&id, &hb) {
        Ok(snapshot) => ApiResponse::ok(snapshot).into_response(),
        Err(e) => registry_error(&e),
    }
}

/// GET /api/v1/nodes/{id}/commands
pub async fn drain_commands(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    if let Err(e) = state.router.deps().registry.snapshot(&id) {
        return registry_error(&e);
    }
    ApiResponse::ok(state.mailboxes.drain(&id)).into_response()
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let deps = state.router.deps();
    let (decisions_total, scale_actions_total) = deps.log.totals();
    let warm = deps
        .sizer
        .targets()
        .iter()
        .map(|(f, pool, desired)| (f.clone(), pool, desired, deps.registry.warm_for(pool, f)))
        .collect();
    let snapshot = MetricsSnapshot {
        router: state.router.stats(),
        nodes: deps.registry.list_nodes(),
        decisions_total,
        scale_actions_total,
        events_dropped: deps.recorder.dropped_count(),
        warm,
    };

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        render_prometheus(&snapshot),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use prepline_core::config::{
        DecisionsConfig, PredictorConfig, PrewarmConfig, RegistryConfig, RouterConfig, SizerConfig,
        TrafficConfig,
    };
    use prepline_core::{ManualClock, SharedClock};
    use prepline_decisions::DecisionLog;
    use prepline_predict::PatternPredictor;
    use prepline_prewarm::{ChannelAgent, PrewarmScheduler};
    use prepline_registry::NodeRegistry;
    use prepline_router::{FunctionDirectory, Router, RouterDeps, StaticDirectory};
    use prepline_sizer::WarmPoolSizer;
    use prepline_state::Runtime;
    use prepline_traffic::{TrafficObserver, recorder_channel};

    use crate::NodeMailboxes;

    fn test_state() -> ApiState {
        let clock: SharedClock = ManualClock::new(1_704_067_200_000);
        let directory: Arc<dyn FunctionDirectory> = Arc::new(StaticDirectory::new(vec![
            FunctionProfile::new("resize", Runtime::Nodejs18, PoolType::Cpu),
        ]));
        let registry = Arc::new(NodeRegistry::new(RegistryConfig::default(), clock.clone()));
        let observer = Arc::new(TrafficObserver::new(TrafficConfig::default(), clock.clone()));
        let (recorder, _) = recorder_channel(16);
        let predictor = Arc::new(PatternPredictor::new(
            Arc::clone(&observer),
            PredictorConfig::default(),
            clock.clone(),
        ));
        let sizer = Arc::new(WarmPoolSizer::new(
            Arc::clone(&directory),
            Arc::clone(&observer),
            Arc::clone(&predictor),
            SizerConfig::default(),
            clock.clone(),
        ));
        let log = Arc::new(DecisionLog::new(&DecisionsConfig::default()));
        let (agent, _) = ChannelAgent::new(16);
        let scheduler = Arc::new(PrewarmScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&sizer),
            Arc::clone(&observer),
            Arc::clone(&log),
            Arc::new(agent),
            PrewarmConfig::default(),
            clock.clone(),
        ));
        let deps = RouterDeps {
            directory,
            registry,
            observer,
            recorder,
            sizer,
            log,
        };
        ApiState {
            router: Arc::new(Router::new(deps, RouterConfig::default(), clock)),
            scheduler,
            predictor,
            mailboxes: Arc::new(NodeMailboxes::new(16)),
        }
    }

    fn node_request(pool_type: &str) -> RegisterNodeRequest {
        RegisterNodeRequest {
            node_id: "n1".into(),
            pool_type: pool_type.into(),
            free_cpu_percent: 70.0,
            free_mem_gib: 8.0,
            max_running: 4,
        }
    }

    #[tokio::test]
    async fn register_node_created() {
        let state = test_state();
        let resp = register_node(State(state.clone()), Json(node_request("CPU"))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(state.router.deps().registry.len(), 1);
    }

    #[tokio::test]
    async fn register_node_rejects_unknown_pool() {
        let state = test_state();
        let resp = register_node(State(state.clone()), Json(node_request("TPU"))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.router.deps().registry.is_empty());
    }

    #[tokio::test]
    async fn invoke_places_and_logs() {
        let state = test_state();
        register_node(State(state.clone()), Json(node_request("CPU"))).await;

        let resp = invoke(
            State(state.clone()),
            Path("resize".to_string()),
            Json(InvokeRequest::default()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = latest_decision(State(state), Path("resize".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invoke_unknown_function_not_found() {
        let resp = invoke(
            State(test_state()),
            Path("nope".to_string()),
            Json(InvokeRequest::default()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invoke_without_nodes_is_unavailable() {
        let resp = invoke(
            State(test_state()),
            Path("resize".to_string()),
            Json(InvokeRequest::default()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn latest_decision_missing() {
        let resp = latest_decision(State(test_state()), Path("resize".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn completion_for_unknown_node() {
        let req = CompletionRequest {
            function_id: "resize".into(),
            node_id: "ghost".into(),
            duration_ms: 12.0,
            success: true,
        };
        let resp = complete(State(test_state()), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn warm_status_rejects_bad_pool() {
        let resp = warm_status(
            State(test_state()),
            Path("resize".to_string()),
            Query(PoolQuery {
                pool: Some("quantum".into()),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn commands_for_unknown_node() {
        let resp = drain_commands(State(test_state()), Path("ghost".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_are_plain_text() {
        let resp = prometheus_metrics(State(test_state())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }
}
