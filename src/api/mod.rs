//! Network surfaces of a pattern server
//!
//! - RPC port: `POST /rpc`, the `ps` service consumed by the fan-out client
//! - HTTP port: `GET /status` liveness and `GET /state` node state dump

pub mod messages;
pub mod rpc;
pub mod service;
mod telemetry;

pub use service::PatternService;

use crate::cluster::NodeStateHandle;
use crate::store::PatternStore;

use axum::extract::State;
use axum::Json;
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;

/// Build the RPC router
pub fn build_rpc_router(service: Arc<PatternService>) -> Router {
    use axum::middleware;
    use axum::routing::post;

    Router::new()
        .route(messages::RPC_ENDPOINT, post(rpc::handle_rpc))
        .with_state(service)
        .layer(middleware::from_fn(telemetry::http_observability_middleware))
}

/// Build the status router
pub fn build_status_router(state: NodeStateHandle, store: Arc<PatternStore>) -> Router {
    use axum::middleware;
    use axum::routing::get;
    use tower_http::cors::{Any, CorsLayer};

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(status))
        .route("/state", get(node_state))
        .with_state(StatusState { state, store })
        .layer(middleware::from_fn(telemetry::http_observability_middleware))
        .layer(cors)
}

/// Shared status endpoint state
#[derive(Clone)]
pub struct StatusState {
    pub state: NodeStateHandle,
    pub store: Arc<PatternStore>,
}

/// Liveness endpoint
async fn status() -> Json<Value> {
    Json(json!({ "status": "success" }))
}

/// Current node state snapshot together with storage tier counters
async fn node_state(State(status): State<StatusState>) -> Json<Value> {
    let snapshot = status.state.snapshot();
    Json(json!({
        "node": snapshot.view(),
        "store": status.store.stats(),
    }))
}
