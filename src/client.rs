//! Component HTTP Client
//!
//! Thin wrapper over reqwest carrying the per-call deadlines each
//! inter-component call is allowed: 60 s for sync replication, 2 s for
//! heartbeats, 5 s for read-quorum queries. Transport failures map onto
//! [`Error::Unreachable`] / [`Error::ConnectionTimeout`] so quorum logic can
//! treat a refused connection as a failed ack.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{HEARTBEAT_TIMEOUT_S, SYNC_REPLICATE_TIMEOUT_S};
use crate::error::{Error, Result};
use crate::protocol::{
    BulkLoadRequest, BulkLoadResponse, DeregisterRequest, ErrorResponse, HealthResponse,
    HeartbeatRequest, HeartbeatResponse, NodeDescriptor, NodeWriteRequest, NodeWriteResponse,
    OkResponse, ReadResponse, ReplicateRequest, ReplicateResponse, SnapshotResponse, SpawnRequest,
    SpawnResponse,
};
use crate::registry::MembershipEntry;

/// Connect timeout applied to every outbound call
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP client for inter-component calls
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    /// Create a new client
    pub fn new() -> Self {
        let inner = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self { inner }
    }

    // ============ Node calls ============

    /// Replicate a write to a follower. The deadline covers the follower's
    /// configured apply delay.
    pub async fn replicate(
        &self,
        base: &str,
        req: &ReplicateRequest,
        deadline: Duration,
    ) -> Result<ReplicateResponse> {
        self.post_json(&format!("{}/replicate", base), req, deadline)
            .await
    }

    /// Drive a leader write, including its sync fan-out
    pub async fn write_node(
        &self,
        base: &str,
        req: &NodeWriteRequest,
    ) -> Result<NodeWriteResponse> {
        // The leader itself enforces the 60 s fan-out deadline; leave headroom
        let deadline = Duration::from_secs(SYNC_REPLICATE_TIMEOUT_S + 5);
        self.post_json(&format!("{}/write", base), req, deadline)
            .await
    }

    /// Read a key from a node. `Ok(None)` means the node does not have it;
    /// a tombstone comes back as `Some` with `deleted` set so callers can
    /// rank the delete against stale live values.
    pub async fn read(
        &self,
        base: &str,
        key: &str,
        deadline: Duration,
    ) -> Result<Option<ReadResponse>> {
        let url = format!("{}/read/{}", base, key);
        let response = self
            .request(self.inner.get(&url), &url, deadline)
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // A tombstone body still parses as a ReadResponse
            return Ok(response.json::<ReadResponse>().await.ok().filter(|r| r.deleted));
        }
        if status.is_success() {
            let body = response
                .json::<ReadResponse>()
                .await
                .map_err(|e| Error::Network(format!("decoding {}: {}", url, e)))?;
            return Ok(Some(body));
        }
        Err(upstream_error(status.as_u16(), response.text().await.ok()))
    }

    /// Fetch a node's full snapshot
    pub async fn snapshot(&self, base: &str) -> Result<SnapshotResponse> {
        self.get_json(&format!("{}/snapshot", base), Duration::from_secs(30))
            .await
    }

    /// Bulk-load a snapshot into a node, bypassing the replication delay
    pub async fn bulk_load(
        &self,
        base: &str,
        req: &BulkLoadRequest,
    ) -> Result<BulkLoadResponse> {
        self.post_json(&format!("{}/bulk-load", base), req, Duration::from_secs(30))
            .await
    }

    /// Probe a node's health endpoint
    pub async fn health(&self, base: &str) -> Result<HealthResponse> {
        self.get_json(&format!("{}/health", base), Duration::from_secs(2))
            .await
    }

    // ============ Registry calls ============

    /// Deliver one heartbeat
    pub async fn heartbeat(
        &self,
        registry: &str,
        req: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        self.post_json(
            &format!("{}/heartbeat", registry),
            req,
            Duration::from_secs(HEARTBEAT_TIMEOUT_S),
        )
        .await
    }

    /// Graceful removal from the registry
    pub async fn deregister(&self, registry: &str, node_id: &str) -> Result<OkResponse> {
        self.post_json(
            &format!("{}/deregister", registry),
            &DeregisterRequest {
                node_id: node_id.to_string(),
            },
            Duration::from_secs(HEARTBEAT_TIMEOUT_S),
        )
        .await
    }

    /// Descriptors of nodes the registry has not pruned
    pub async fn alive_nodes(&self, registry: &str) -> Result<Vec<NodeDescriptor>> {
        self.get_json(&format!("{}/alive", registry), Duration::from_secs(2))
            .await
    }

    /// All membership entries regardless of state
    pub async fn registry_nodes(&self, registry: &str) -> Result<Vec<MembershipEntry>> {
        self.get_json(&format!("{}/nodes", registry), Duration::from_secs(2))
            .await
    }

    // ============ Coordinator calls ============

    /// Ask the coordinator to spawn a follower, optionally hinting at a
    /// pruned id to respawn
    pub async fn spawn(&self, coordinator: &str, hint: Option<&str>) -> Result<SpawnResponse> {
        self.post_json(
            &format!("{}/spawn", coordinator),
            &SpawnRequest {
                node_id: hint.map(str::to_string),
            },
            Duration::from_secs(60),
        )
        .await
    }

    /// Hint the coordinator that a resurrected follower needs catch-up
    pub async fn catchup_hint(&self, coordinator: &str, node_id: &str) -> Result<OkResponse> {
        self.post_json(
            &format!("{}/catchup/{}", coordinator, node_id),
            &serde_json::json!({}),
            Duration::from_secs(60),
        )
        .await
    }

    // ============ Plumbing ============

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        deadline: Duration,
    ) -> Result<T> {
        let response = self
            .request(self.inner.post(url).json(body), url, deadline)
            .await?;
        self.decode(url, response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, deadline: Duration) -> Result<T> {
        let response = self.request(self.inner.get(url), url, deadline).await?;
        self.decode(url, response).await
    }

    async fn request(
        &self,
        builder: reqwest::RequestBuilder,
        url: &str,
        deadline: Duration,
    ) -> Result<reqwest::Response> {
        builder
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| transport_error(url, e))
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        url: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            response
                .json::<T>()
                .await
                .map_err(|e| Error::Network(format!("decoding {}: {}", url, e)))
        } else {
            Err(upstream_error(status.as_u16(), response.text().await.ok()))
        }
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a transport failure onto the quorum-visible error kinds
pub(crate) fn transport_error(url: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::ConnectionTimeout(url.to_string())
    } else if err.is_connect() {
        Error::Unreachable {
            address: url.to_string(),
            reason: err.to_string(),
        }
    } else {
        Error::Network(err.to_string())
    }
}

/// Rebuild an error from a peer's error response, preserving its status
fn upstream_error(status: u16, body: Option<String>) -> Error {
    let parsed = body
        .as_deref()
        .and_then(|b| serde_json::from_str::<ErrorResponse>(b).ok());
    match parsed {
        Some(e) => Error::Upstream {
            status,
            code: e.code,
            message: e.error,
        },
        None => Error::Upstream {
            status,
            code: "UNKNOWN".to_string(),
            message: body.unwrap_or_default(),
        },
    }
}
