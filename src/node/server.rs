//! Node HTTP API
//!
//! The node's data-plane endpoints: leader writes, follower replication,
//! reads, snapshot/bulk-load for catch-up, and health.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::gateway::rate_limit::{self, Decision};
use crate::node::{load, replication, NodeState};
use crate::protocol::{
    ApiError, ApiJson, BulkLoadRequest, BulkLoadResponse, HealthResponse, NodeRole,
    NodeWriteRequest, NodeWriteResponse, ReadResponse, ReplicateRequest, ReplicateResponse,
    SnapshotResponse,
};
use crate::store::Record;

/// Build the node router
pub fn router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/write", post(handle_write))
        .route("/replicate", post(handle_replicate))
        .route("/read/:key", get(handle_read))
        .route("/snapshot", get(handle_snapshot))
        .route("/bulk-load", post(handle_bulk_load))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Leader-only write: apply locally under the key lock, wait for every sync
/// follower in parallel, fire async replication, answer with the version.
async fn handle_write(
    State(state): State<Arc<NodeState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<NodeWriteRequest>,
) -> Result<Json<NodeWriteResponse>, ApiError> {
    check_rate_limit(&state, &headers, peer)?;
    load::simulate(state.config.load_factor).await;

    if state.role != NodeRole::Leader {
        return Err(Error::NotLeader(state.config.id.clone()).into());
    }
    if req.key.is_empty() {
        return Err(Error::InvalidRequest("key must be non-empty".into()).into());
    }

    // Writes to the same key are serialized for the whole fan-out; writes
    // to other keys proceed in parallel.
    let _guard = state.store.lock_key(&req.key).await;

    let version = state.store.version_of(&req.key).await + 1;
    let record = if req.deleted {
        Record::tombstone(version)
    } else {
        Record::new(req.value.clone(), version)
    };
    state.store.put(req.key.clone(), record).await;
    tracing::debug!("leader applied '{}' at v{}", req.key, version);

    let replicate = ReplicateRequest {
        key: req.key.clone(),
        value: req.value,
        version,
        deleted: req.deleted,
    };

    // On a failed sync ack the locally-applied value is retained; the next
    // accepted write continues the version chain from it.
    let sync_acks =
        replication::fan_out_sync(&state.client, &req.sync_followers, &replicate).await?;
    replication::fan_out_async(&state.client, &req.async_followers, &replicate);

    Ok(Json(NodeWriteResponse { version, sync_acks }))
}

/// Follower-side apply. Sleeps the configured delay first, then applies only
/// strictly newer versions; older or duplicate deliveries are dropped and
/// still acknowledged (idempotent).
async fn handle_replicate(
    State(state): State<Arc<NodeState>>,
    ApiJson(req): ApiJson<ReplicateRequest>,
) -> Result<Json<ReplicateResponse>, ApiError> {
    let store = Arc::clone(&state.store);
    let delay = Duration::from_millis(state.config.replication_delay_ms);
    let record = Record {
        value: req.value,
        version: req.version,
        deleted: req.deleted,
    };
    let key = req.key;

    // Detached task: once accepted, an apply proceeds even if the leader's
    // connection goes away mid-delay.
    let apply = tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let (accepted, local_version) = store.apply_if_newer(&key, record).await;
        if accepted {
            tracing::debug!("replica applied '{}' at v{}", key, local_version);
        } else {
            tracing::debug!(
                "replica dropped stale '{}' (local v{} is newer)",
                key,
                local_version
            );
        }
        (accepted, local_version)
    });

    let (accepted, local_version) = apply
        .await
        .map_err(|e| Error::Internal(format!("replicate task failed: {}", e)))?;
    Ok(Json(ReplicateResponse {
        accepted,
        local_version,
    }))
}

/// Read one key. Missing keys are a plain 404; tombstones are a 404 that
/// still carries the version so quorum reads can rank the delete.
async fn handle_read(
    State(state): State<Arc<NodeState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    check_rate_limit(&state, &headers, peer)?;
    load::simulate(state.config.load_factor).await;

    match state.store.get(&key).await {
        Some(record) if record.deleted => Ok((
            StatusCode::NOT_FOUND,
            Json(ReadResponse {
                value: serde_json::Value::Null,
                version: record.version,
                deleted: true,
            }),
        )
            .into_response()),
        Some(record) => Ok(Json(ReadResponse {
            value: record.value,
            version: record.version,
            deleted: false,
        })
        .into_response()),
        None => Err(Error::NotFound(key).into()),
    }
}

async fn handle_snapshot(State(state): State<Arc<NodeState>>) -> Json<SnapshotResponse> {
    Json(SnapshotResponse {
        records: state.store.snapshot().await,
    })
}

/// Catch-up ingestion: applies a full snapshot immediately, bypassing the
/// replication delay, with the same monotonic rule as replication.
async fn handle_bulk_load(
    State(state): State<Arc<NodeState>>,
    ApiJson(req): ApiJson<BulkLoadRequest>,
) -> Json<BulkLoadResponse> {
    let loaded = state.store.bulk_load(req.records).await;
    tracing::info!("bulk-load applied {} records", loaded);
    Json(BulkLoadResponse { loaded })
}

async fn handle_health(State(state): State<Arc<NodeState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        node_id: state.config.id.clone(),
        role: state.role,
        uptime_s: state.uptime_s(),
        record_count: state.store.record_count().await,
        startup_epoch: state.config.startup_epoch,
        replication_delay_ms: state.config.replication_delay_ms,
    })
}

fn check_rate_limit(
    state: &NodeState,
    headers: &HeaderMap,
    peer: SocketAddr,
) -> Result<(), ApiError> {
    if let Some(limiter) = &state.limiter {
        let client = rate_limit::client_identity(headers, Some(peer));
        if let Decision::Limited { retry_after } = limiter.check(&client) {
            return Err(Error::RateLimited {
                retry_after_s: retry_after.as_secs_f64(),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpClient;
    use crate::config::NodeConfig;
    use serde_json::json;

    async fn serve(config: NodeConfig) -> (String, Arc<NodeState>) {
        let state = Arc::new(NodeState::new(config).unwrap());
        let app = router(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (format!("http://{}", addr), state)
    }

    fn leader_config() -> NodeConfig {
        NodeConfig {
            id: "leader".into(),
            role: "leader".into(),
            ..Default::default()
        }
    }

    fn follower_config(delay_ms: u64) -> NodeConfig {
        NodeConfig {
            id: "follower-test".into(),
            role: "follower".into(),
            replication_delay_ms: delay_ms,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_leader_write_fans_out_and_versions() {
        let (leader_url, leader) = serve(leader_config()).await;
        let (f1_url, f1) = serve(follower_config(0)).await;
        let (f2_url, f2) = serve(follower_config(0)).await;
        let client = HttpClient::new();

        let resp = client
            .write_node(
                &leader_url,
                &NodeWriteRequest {
                    key: "a".into(),
                    value: json!("1"),
                    sync_followers: vec![f1_url.clone(), f2_url.clone()],
                    async_followers: vec![],
                    deleted: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.version, 1);
        assert_eq!(resp.sync_acks, 2);

        // Quorum honesty: both sync followers hold the write at response time
        assert_eq!(f1.store.version_of("a").await, 1);
        assert_eq!(f2.store.version_of("a").await, 1);
        assert_eq!(leader.store.version_of("a").await, 1);

        // Second write to the same key increments by exactly one
        let resp = client
            .write_node(
                &leader_url,
                &NodeWriteRequest {
                    key: "a".into(),
                    value: json!("2"),
                    sync_followers: vec![f1_url, f2_url],
                    async_followers: vec![],
                    deleted: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.version, 2);
    }

    #[tokio::test]
    async fn test_failed_sync_ack_errors_but_retains_local() {
        let (leader_url, leader) = serve(leader_config()).await;
        let client = HttpClient::new();

        let err = client
            .write_node(
                &leader_url,
                &NodeWriteRequest {
                    key: "c".into(),
                    value: json!("y"),
                    sync_followers: vec!["http://127.0.0.1:1".into()],
                    async_followers: vec![],
                    deleted: false,
                },
            )
            .await
            .expect_err("unreachable sync follower must fail the write");
        assert_eq!(err.http_status(), 503);

        // Leader-authoritative: the local apply is not rolled back
        assert_eq!(leader.store.version_of("c").await, 1);
    }

    #[tokio::test]
    async fn test_follower_rejects_client_write() {
        let (url, _state) = serve(follower_config(0)).await;
        let client = HttpClient::new();

        let err = client
            .write_node(
                &url,
                &NodeWriteRequest {
                    key: "a".into(),
                    value: json!("1"),
                    sync_followers: vec![],
                    async_followers: vec![],
                    deleted: false,
                },
            )
            .await
            .expect_err("follower must refuse client writes");
        assert_eq!(err.http_status(), 503);
    }

    #[tokio::test]
    async fn test_replicate_out_of_order_keeps_newest() {
        let (url, state) = serve(follower_config(0)).await;
        let client = HttpClient::new();

        // v2 then v1, as the scenario where deliveries raced
        let resp = client
            .replicate(
                &url,
                &ReplicateRequest {
                    key: "k".into(),
                    value: json!("v2"),
                    version: 2,
                    deleted: false,
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(resp.accepted);

        let resp = client
            .replicate(
                &url,
                &ReplicateRequest {
                    key: "k".into(),
                    value: json!("v1"),
                    version: 1,
                    deleted: false,
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(!resp.accepted);
        assert_eq!(resp.local_version, 2);

        let record = state.store.get("k").await.unwrap();
        assert_eq!(record.value, json!("v2"));
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn test_replicate_waits_configured_delay() {
        let (url, state) = serve(follower_config(200)).await;
        let client = HttpClient::new();

        let started = std::time::Instant::now();
        let handle = {
            let client = client.clone();
            let url = url.clone();
            tokio::spawn(async move {
                client
                    .replicate(
                        &url,
                        &ReplicateRequest {
                            key: "slow".into(),
                            value: json!("x"),
                            version: 1,
                            deleted: false,
                        },
                        Duration::from_secs(5),
                    )
                    .await
            })
        };

        // Mid-delay the write is not yet visible: the stale-read window
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(state.store.version_of("slow").await, 0);

        handle.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(state.store.version_of("slow").await, 1);
    }

    #[tokio::test]
    async fn test_bulk_load_bypasses_delay() {
        let (url, state) = serve(follower_config(5_000)).await;
        let client = HttpClient::new();

        let mut records = std::collections::HashMap::new();
        records.insert("d".to_string(), Record::new(json!("1"), 1));
        records.insert("e".to_string(), Record::new(json!("2"), 1));

        let started = std::time::Instant::now();
        let resp = client
            .bulk_load(&url, &BulkLoadRequest { records })
            .await
            .unwrap();
        assert_eq!(resp.loaded, 2);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(state.store.record_count().await, 2);
    }

    #[tokio::test]
    async fn test_read_missing_and_tombstone() {
        let (url, state) = serve(follower_config(0)).await;
        let client = HttpClient::new();

        // Missing key: plain 404 with no version to rank
        let result = client
            .read(&url, "ghost", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.is_none());

        // Tombstone: 404 that still reports the delete's version
        state.store.put("gone".into(), Record::tombstone(3)).await;
        let result = client
            .read(&url, "gone", Duration::from_secs(5))
            .await
            .unwrap()
            .expect("tombstone must carry a version");
        assert!(result.deleted);
        assert_eq!(result.version, 3);
    }

    #[tokio::test]
    async fn test_health_reports_role_and_count() {
        let (url, state) = serve(follower_config(500)).await;
        state.store.put("a".into(), Record::new(json!("1"), 1)).await;

        let client = HttpClient::new();
        let health = client.health(&url).await.unwrap();
        assert_eq!(health.role, NodeRole::Follower);
        assert_eq!(health.record_count, 1);
        assert_eq!(health.replication_delay_ms, 500);
    }

    #[tokio::test]
    async fn test_node_level_rate_limit() {
        let mut config = follower_config(0);
        config.rate_limit = "fixed-window".into();
        config.rate_limit_max = 2;
        config.rate_limit_window_s = 60;
        let (url, _state) = serve(config).await;

        let http = reqwest::Client::new();
        for _ in 0..2 {
            let resp = http
                .get(format!("{}/read/x", url))
                .header("x-client-id", "tester")
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status().as_u16(), 404); // allowed through, key absent
        }
        let resp = http
            .get(format!("{}/read/x", url))
            .header("x-client-id", "tester")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 429);
    }
}
