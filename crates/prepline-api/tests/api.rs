//! HTTP-level tests through the assembled router.

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use prepline_api::{ApiState, NodeMailboxes, build_router};
use prepline_core::config::{
    DecisionsConfig, PredictorConfig, PrewarmConfig, RegistryConfig, RouterConfig, SizerConfig, TrafficConfig,
};
use prepline_core::{ManualClock, SharedClock};
use prepline_decisions::DecisionLog;
use prepline_predict::PatternPredictor;
use prepline_prewarm::{ChannelAgent, PrewarmScheduler};
use prepline_registry::NodeRegistry;
use prepline_router::{FunctionDirectory, Router, RouterDeps, StaticDirectory};
use prepline_sizer::WarmPoolSizer;
use prepline_state::{FunctionProfile, PoolType, Runtime};
use prepline_traffic::{TrafficObserver, recorder_channel};

fn app() -> axum::Router {
    let clock: SharedClock = ManualClock::new(1_704_067_200_000);
    let directory: Arc<dyn FunctionDirectory> = Arc::new(StaticDirectory::new(vec![
        FunctionProfile::new("thumbnail", Runtime::Python311, PoolType::Cpu),
    ]));
    let registry = Arc::new(NodeRegistry::new(RegistryConfig::default(), clock.clone()));
    let observer = Arc::new(TrafficObserver::new(TrafficConfig::default(), clock.clone()));
    let (recorder, _) = recorder_channel(64);
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
    build_router(ApiState {
        router: Arc::new(Router::new(deps, RouterConfig::default(), clock)),
        scheduler,
        predictor,
        mailboxes: Arc::new(NodeMailboxes::new(16)),
    })
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn node(node_id: &str, pool_type: &str) -> Value {
    json!({
        "node_id": node_id,
        "pool_type": pool_type,
        "free_cpu_percent": 75.0,
        "free_mem_gib": 8.0,
        "max_running": 4
    })
}

#[tokio::test]
async fn register_and_list_nodes() {
    let app = app();
    let resp = app.clone().oneshot(post("/api/v1/nodes", node("n1", "cpu"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = app.oneshot(get("/api/v1/nodes")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"][0]["node_id"], "n1");
    assert_eq!(body["data"][0]["pool_type"], "CPU");
}

#[tokio::test]
async fn unknown_pool_is_rejected() {
    let resp = app().oneshot(post("/api/v1/nodes", node("n1", "TPU"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = json_body(resp).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "INVALID_NODE_STATE");
}

#[tokio::test]
async fn warm_node_wins_placement() {
    let app = app();
    app.clone().oneshot(post("/api/v1/nodes", node("n1", "CPU"))).await.unwrap();
    app.clone().oneshot(post("/api/v1/nodes", node("n2", "CPU"))).await.unwrap();
    let resp = app
        .clone()
        .oneshot(post(
            "/api/v1/nodes/n2/heartbeat",
            json!({
                "free_cpu_percent": 20.0,
                "free_mem_gib": 8.0,
                "running_functions_count": 0,
                "warm": {"thumbnail": 1}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(post("/api/v1/functions/thumbnail/invoke", json!({"args": {"w": 64}})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["data"]["mode"], "warm");
    assert_eq!(body["data"]["decision"]["node_id"], "n2");

    let resp = app
        .clone()
        .oneshot(post(
            "/api/v1/completions",
            json!({"function_id": "thumbnail", "node_id": "n2", "duration_ms": 35.0, "success": true}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(get("/api/v1/functions/thumbnail/decisions?limit=5"))
        .await
        .unwrap();
    let body = json_body(resp).await;
    assert_eq!(body["data"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn unknown_function_is_not_found() {
    let resp = app()
        .oneshot(post("/api/v1/functions/ghost/invoke", json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = json_body(resp).await;
    assert_eq!(body["error"]["code"], "FUNCTION_UNAVAILABLE");
}

#[tokio::test]
async fn heartbeat_for_unknown_node() {
    let resp = app()
        .oneshot(post(
            "/api/v1/nodes/ghost/heartbeat",
            json!({"free_cpu_percent": 50.0, "free_mem_gib": 4.0, "running_functions_count": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn function_views_resolve() {
    let app = app();
    for uri in [
        "/api/v1/functions/thumbnail",
        "/api/v1/functions/thumbnail/warm",
        "/api/v1/functions/thumbnail/timeline?pool=GPU",
        "/api/v1/functions/thumbnail/prediction?horizon=30&lookback=30",
        "/api/v1/functions/thumbnail/heatmap",
    ] {
        let resp = app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "{uri}");
    }
}

#[tokio::test]
async fn metrics_exposition() {
    let resp = app().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("prepline_placements_total{mode=\"cold\"} 0"));
}
