//! prepline-api — REST API for Prepline.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/functions/{id}/invoke` | Place an invocation |
//! | POST | `/api/v1/completions` | Report a finished invocation |
//! | GET | `/api/v1/functions/{id}` | Profile, live stats, status class |
//! | GET | `/api/v1/functions/{id}/decisions/latest` | Latest placement |
//! | GET | `/api/v1/functions/{id}/decisions?limit=` | Placement history |
//! | GET | `/api/v1/functions/{id}/warm?pool=` | Desired vs. current warm |
//! | GET | `/api/v1/functions/{id}/timeline?pool=` | QPS and warm timeline |
//! | GET | `/api/v1/functions/{id}/prediction?horizon=&lookback=` | Forecast |
//! | GET | `/api/v1/functions/{id}/heatmap` | Day-of-week × hour grid |
//! | GET | `/api/v1/nodes` | List nodes |
//! | POST | `/api/v1/nodes` | Register a node |
//! | POST | `/api/v1/nodes/{id}/heartbeat` | Node heartbeat |
//! | GET | `/api/v1/nodes/{id}/commands` | Drain a node's scale commands |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod mailbox;
pub mod metrics;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use prepline_predict::PatternPredictor;
use prepline_prewarm::PrewarmScheduler;

pub use mailbox::NodeMailboxes;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub router: Arc<prepline_router::Router>,
    pub scheduler: Arc<PrewarmScheduler>,
    pub predictor: Arc<PatternPredictor>,
    pub mailboxes: Arc<NodeMailboxes>,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/functions/{id}", get(handlers::get_function))
        .route("/functions/{id}/invoke", post(handlers::invoke))
        .route("/functions/{id}/decisions", get(handlers::decision_history))
        .route("/functions/{id}/decisions/latest", get(handlers::latest_decision))
        .route("/functions/{id}/warm", get(handlers::warm_status))
        .route("/functions/{id}/timeline", get(handlers::timeline))
        .route("/functions/{id}/prediction", get(handlers::prediction))
        .route("/functions/{id}/heatmap", get(handlers::heatmap))
        .route("/completions", post(handlers::complete))
        .route("/nodes", get(handlers::list_nodes).post(handlers::register_node))
        .route("/nodes/{id}/heartbeat", post(handlers::heartbeat))
        .route("/nodes/{id}/commands", get(handlers::drain_commands))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
