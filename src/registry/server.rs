//! Registry HTTP API
//!
//! Heartbeat ingestion, graceful deregistration, and membership queries.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::client::HttpClient;
use crate::protocol::{
    ApiJson, DeregisterRequest, HeartbeatRequest, HeartbeatResponse, NodeDescriptor, NodeRole,
    OkResponse,
};
use crate::registry::membership::{MembershipEntry, MembershipTable, RegistrySummary};

/// Shared registry state
pub struct AppState {
    pub table: Arc<MembershipTable>,
    pub coordinator_url: Option<String>,
    pub client: HttpClient,
}

/// Build the registry router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/heartbeat", post(handle_heartbeat))
        .route("/deregister", post(handle_deregister))
        .route("/nodes", get(handle_nodes))
        .route("/alive", get(handle_alive))
        .route("/summary", get(handle_summary))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_heartbeat(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    let outcome = state.table.heartbeat(&req).await;

    // A pruned follower that came back on its own missed any writes accepted
    // while it was out; hint the coordinator to run catch-up against it.
    if outcome.resurrected && req.role == NodeRole::Follower {
        if let Some(coordinator) = state.coordinator_url.clone() {
            let client = state.client.clone();
            let node_id = req.node_id.clone();
            tokio::spawn(async move {
                if let Err(e) = client.catchup_hint(&coordinator, &node_id).await {
                    tracing::warn!("catch-up hint for '{}' failed: {}", node_id, e);
                }
            });
        }
    }

    Json(HeartbeatResponse {
        ok: true,
        resurrected: outcome.resurrected,
    })
}

async fn handle_deregister(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<DeregisterRequest>,
) -> Json<OkResponse> {
    state.table.deregister(&req.node_id).await;
    Json(OkResponse { ok: true })
}

async fn handle_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<MembershipEntry>> {
    Json(state.table.all().await)
}

async fn handle_alive(State(state): State<Arc<AppState>>) -> Json<Vec<NodeDescriptor>> {
    Json(state.table.alive().await)
}

async fn handle_summary(State(state): State<Arc<AppState>>) -> Json<RegistrySummary> {
    Json(state.table.summary().await)
}
