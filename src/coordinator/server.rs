//! Coordinator HTTP API
//!
//! Client-facing quorum writes and reads, plus the control endpoints:
//! spawn, kill, catch-up, and status.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tokio::sync::{Mutex, RwLock};
use tower_http::trace::TraceLayer;

use crate::client::HttpClient;
use crate::config::{CoordinatorConfig, ASYNC_REPLICA_DELAY_MS};
use crate::coordinator::layout::{ClusterLayout, FollowerSlot};
use crate::coordinator::{catchup, quorum, spawner};
use crate::error::{Error, Result};
use crate::protocol::{
    ApiError, ApiJson, ClientReadResponse, ClientWriteRequest, ClientWriteResponse,
    ClusterStatusResponse, FollowerStatus, NodeRole, OkResponse, SpawnRequest, SpawnResponse,
};
use crate::registry::EntryState;

/// How long a fresh spawn may take to answer its first health probe
const SPAWN_HEALTH_DEADLINE: Duration = Duration::from_secs(10);

/// Shared coordinator state
pub struct AppState {
    pub config: CoordinatorConfig,
    pub layout: RwLock<ClusterLayout>,
    /// Node ids the registry considers live; refreshed in the background
    /// and kept at its last known value when the registry is unreachable
    pub live: RwLock<HashSet<String>>,
    pub client: HttpClient,
    pub spawner: Mutex<spawner::Spawner>,
}

impl AppState {
    pub fn new(
        config: CoordinatorConfig,
        layout: ClusterLayout,
        spawner: spawner::Spawner,
    ) -> Self {
        // Optimistic until the first registry refresh lands
        let live: HashSet<String> = layout
            .followers()
            .iter()
            .map(|f| f.node_id.clone())
            .chain(std::iter::once(layout.leader_id.clone()))
            .collect();
        Self {
            config,
            layout: RwLock::new(layout),
            live: RwLock::new(live),
            client: HttpClient::new(),
            spawner: Mutex::new(spawner),
        }
    }

    pub async fn live_ids(&self) -> HashSet<String> {
        self.live.read().await.clone()
    }

    /// Pull the live set from the registry; keep the cache on failure
    pub async fn refresh_liveness(&self) {
        match self.client.alive_nodes(&self.config.registry_url).await {
            Ok(descriptors) => {
                let ids: HashSet<String> =
                    descriptors.into_iter().map(|d| d.node_id).collect();
                *self.live.write().await = ids;
            }
            Err(e) => {
                tracing::debug!("liveness refresh failed, keeping cached set: {}", e);
            }
        }
    }
}

/// Refresh the live set once a second
pub fn start_liveness_refresh(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            state.refresh_liveness().await;
        }
    })
}

/// Build the coordinator router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/write", post(handle_write))
        .route("/read/:key", get(handle_read))
        .route("/delete/:key", delete(handle_delete))
        .route("/spawn", post(handle_spawn))
        .route("/kill/:node_id", post(handle_kill))
        .route("/catchup/:node_id", post(handle_catchup))
        .route("/status", get(handle_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_write(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<ClientWriteRequest>,
) -> std::result::Result<Json<ClientWriteResponse>, ApiError> {
    if req.key.is_empty() {
        return Err(Error::InvalidRequest("key must be non-empty".into()).into());
    }
    let live = state.live_ids().await;
    let layout = state.layout.read().await.clone();
    let response =
        quorum::quorum_write(&state.client, &layout, &live, req.key, req.value, false).await?;
    Ok(Json(response))
}

async fn handle_read(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> std::result::Result<Json<ClientReadResponse>, ApiError> {
    let live = state.live_ids().await;
    let layout = state.layout.read().await.clone();
    let response = quorum::quorum_read(
        &state.client,
        &layout,
        &live,
        &key,
        state.config.read_retry,
        state.config.read_repair,
    )
    .await?;
    Ok(Json(response))
}

async fn handle_delete(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> std::result::Result<Json<ClientWriteResponse>, ApiError> {
    let live = state.live_ids().await;
    let layout = state.layout.read().await.clone();
    let response = quorum::quorum_write(
        &state.client,
        &layout,
        &live,
        key,
        serde_json::Value::Null,
        true,
    )
    .await?;
    Ok(Json(response))
}

async fn handle_spawn(
    State(state): State<Arc<AppState>>,
    body: Option<ApiJson<SpawnRequest>>,
) -> std::result::Result<Json<SpawnResponse>, ApiError> {
    let hint = body.and_then(|ApiJson(req)| req.node_id);
    let response = spawn_follower(&state, hint).await?;
    Ok(Json(response))
}

async fn handle_kill(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> std::result::Result<Json<OkResponse>, ApiError> {
    if node_id == state.layout.read().await.leader_id {
        return Err(
            Error::InvalidRequest("the leader cannot be killed; kill a follower".into()).into(),
        );
    }
    state.spawner.lock().await.kill(&node_id)?;
    // No registry update on purpose: the heartbeat gap is the signal
    Ok(Json(OkResponse { ok: true }))
}

async fn handle_catchup(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> std::result::Result<Json<OkResponse>, ApiError> {
    let (leader_url, follower_url) = {
        let layout = state.layout.read().await;
        let slot = layout
            .follower(&node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.clone()))?;
        (layout.leader_url(), layout.follower_url(slot))
    };

    // Out of the active set while the snapshot copies over
    state.layout.write().await.set_active(&node_id, false);
    catchup::run(&state.client, &leader_url, &follower_url).await?;
    state.layout.write().await.set_active(&node_id, true);

    Ok(Json(OkResponse { ok: true }))
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<ClusterStatusResponse> {
    let live = state.live_ids().await;
    let layout = state.layout.read().await;

    let followers = layout
        .followers()
        .iter()
        .map(|f| FollowerStatus {
            node_id: f.node_id.clone(),
            port: f.port,
            replication_delay_ms: f.delay_ms,
            active: f.active,
            alive: live.contains(&f.node_id),
        })
        .collect();

    Json(ClusterStatusResponse {
        leader_id: layout.leader_id.clone(),
        leader_port: layout.leader_port,
        write_quorum: layout.write_quorum,
        read_quorum: layout.read_quorum,
        followers,
        sync_set: layout
            .sync_set(&live)
            .iter()
            .map(|f| f.node_id.clone())
            .collect(),
        async_set: layout
            .async_set(&live)
            .iter()
            .map(|f| f.node_id.clone())
            .collect(),
        read_set: layout
            .read_set(&live)
            .iter()
            .map(|f| f.node_id.clone())
            .collect(),
        live_followers: layout.eligible(&live).len(),
    })
}

/// Spawn (or respawn) one follower. Pruned ids keep their original port so
/// the topology stays predictable across failures; brand-new followers get
/// the next port and an async delay (their port is the largest).
pub async fn spawn_follower(state: &AppState, hint: Option<String>) -> Result<SpawnResponse> {
    // One spawn at a time; the lock is held across health-wait and catch-up
    let mut spawner = state.spawner.lock().await;

    let (node_id, port, delay_ms, was_respawn) = {
        let layout = state.layout.read().await;

        let hinted = hint.as_deref().and_then(|id| layout.follower(id)).cloned();
        let respawn_target = match hinted {
            Some(slot) => Some(slot),
            None => pruned_follower(state, &layout).await,
        };

        match respawn_target {
            Some(slot) => (slot.node_id, slot.port, slot.delay_ms, true),
            None => {
                let mut index = layout.followers().len() + 1;
                while layout.follower(&format!("follower-{}", index)).is_some() {
                    index += 1;
                }
                (
                    format!("follower-{}", index),
                    layout.max_port() + 1,
                    ASYNC_REPLICA_DELAY_MS,
                    false,
                )
            }
        }
    };

    // Inactive until catch-up completes
    state.layout.write().await.upsert_follower(FollowerSlot {
        node_id: node_id.clone(),
        port,
        delay_ms,
        active: false,
    });

    spawner.spawn_node(&node_id, port, NodeRole::Follower, delay_ms)?;

    let follower_url = format!("http://{}:{}", state.config.host, port);
    spawner::wait_healthy(&state.client, &follower_url, SPAWN_HEALTH_DEADLINE).await?;

    let leader_url = state.layout.read().await.leader_url();
    catchup::run(&state.client, &leader_url, &follower_url).await?;

    state.layout.write().await.set_active(&node_id, true);
    tracing::info!(
        "follower '{}' on port {} is active (respawn={})",
        node_id,
        port,
        was_respawn
    );
    Ok(SpawnResponse {
        node_id,
        port,
        was_respawn,
    })
}

/// The pruned follower with the smallest port, if any
async fn pruned_follower(state: &AppState, layout: &ClusterLayout) -> Option<FollowerSlot> {
    let entries = state
        .client
        .registry_nodes(&state.config.registry_url)
        .await
        .ok()?;
    entries
        .iter()
        .filter(|e| {
            e.state == EntryState::Pruned && e.descriptor.role == NodeRole::Follower
        })
        .filter_map(|e| layout.follower(&e.descriptor.node_id))
        .min_by_key(|slot| slot.port)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::node::{server as node_server, NodeState};
    use serde_json::json;

    async fn node_on(
        listener: tokio::net::TcpListener,
        id: &str,
        role: &str,
    ) -> Arc<NodeState> {
        let config = NodeConfig {
            id: id.into(),
            role: role.into(),
            replication_delay_ms: 0,
            ..Default::default()
        };
        let state = Arc::new(NodeState::new(config).unwrap());
        let app = node_server::router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .await
            .unwrap();
        });
        state
    }

    /// In-process cluster behind a served coordinator; liveness refresher
    /// stays off so tests control the live set through the initial cache
    async fn coordinator(w: usize, r: usize) -> (String, Arc<AppState>) {
        let leader_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let leader_port = leader_listener.local_addr().unwrap().port();
        node_on(leader_listener, "leader", "leader").await;

        let mut follower_listeners = Vec::new();
        for _ in 0..3 {
            follower_listeners.push(tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        follower_listeners.sort_by_key(|l| l.local_addr().unwrap().port());

        let mut layout =
            ClusterLayout::new("127.0.0.1".into(), "leader".into(), leader_port, w, r);
        for (i, listener) in follower_listeners.into_iter().enumerate() {
            let id = format!("follower-{}", i + 1);
            let port = listener.local_addr().unwrap().port();
            node_on(listener, &id, "follower").await;
            layout.upsert_follower(FollowerSlot {
                node_id: id,
                port,
                delay_ms: 0,
                active: true,
            });
        }

        let config = CoordinatorConfig {
            registry_url: "http://127.0.0.1:1".into(), // no registry in these tests
            ..Default::default()
        };
        let spawner =
            spawner::Spawner::new("127.0.0.1".into(), config.registry_url.clone());
        let state = Arc::new(AppState::new(config, layout, spawner));

        let app = router(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), state)
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (base, _state) = coordinator(2, 2).await;
        let http = reqwest::Client::new();

        let write: ClientWriteResponse = http
            .post(format!("{}/write", base))
            .json(&json!({"key": "a", "value": "1"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(write.version, 1);
        assert_eq!(write.synced_followers.len(), 2);

        let read: ClientReadResponse = http
            .get(format!("{}/read/a", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(read.value, json!("1"));
        assert_eq!(read.version, 1);
    }

    #[tokio::test]
    async fn test_write_503_when_followers_dead() {
        let (base, state) = coordinator(2, 2).await;

        // Registry view: only one follower still alive
        *state.live.write().await = ["follower-3".to_string(), "leader".to_string()]
            .into_iter()
            .collect();

        let response = reqwest::Client::new()
            .post(format!("{}/write", base))
            .json(&json!({"key": "c", "value": "y"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 503);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["code"], "QUORUM_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_delete_then_read_is_404() {
        let (base, _state) = coordinator(2, 2).await;
        let http = reqwest::Client::new();

        http.post(format!("{}/write", base))
            .json(&json!({"key": "d", "value": "x"}))
            .send()
            .await
            .unwrap();

        let delete: ClientWriteResponse = http
            .delete(format!("{}/delete/d", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(delete.version, 2);

        let response = http.get(format!("{}/read/d", base)).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn test_status_exposes_sets_and_liveness() {
        let (base, state) = coordinator(2, 2).await;
        *state.live.write().await = [
            "leader".to_string(),
            "follower-1".to_string(),
            "follower-2".to_string(),
            "follower-3".to_string(),
        ]
        .into_iter()
        .collect();

        let status: ClusterStatusResponse = reqwest::Client::new()
            .get(format!("{}/status", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status.leader_id, "leader");
        assert_eq!(status.write_quorum, 2);
        assert_eq!(status.sync_set, vec!["follower-1", "follower-2"]);
        assert_eq!(status.async_set, vec!["follower-3"]);
        assert_eq!(status.read_set, vec!["follower-3", "follower-2"]);
        assert_eq!(status.live_followers, 3);
    }

    #[tokio::test]
    async fn test_kill_leader_rejected_and_unknown_404() {
        let (base, _state) = coordinator(2, 2).await;
        let http = reqwest::Client::new();

        let response = http
            .post(format!("{}/kill/leader", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);

        let response = http
            .post(format!("{}/kill/follower-9", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn test_catchup_endpoint_activates_follower() {
        let (base, state) = coordinator(2, 2).await;
        state.layout.write().await.set_active("follower-2", false);

        let response = reqwest::Client::new()
            .post(format!("{}/catchup/follower-2", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert!(state
            .layout
            .read()
            .await
            .follower("follower-2")
            .unwrap()
            .active);
    }

    #[tokio::test]
    async fn test_invalid_write_body_is_400() {
        let (base, _state) = coordinator(2, 2).await;
        let response = reqwest::Client::new()
            .post(format!("{}/write", base))
            .json(&json!({"value": "no key"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
    }
}
