//! Wire Protocol
//!
//! Typed request/response bodies for all inter-component HTTP traffic.
//! Unknown JSON fields are ignored everywhere; missing required fields are
//! rejected at the boundary as 400 InvalidRequest via [`ApiJson`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{async_trait, Json};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::store::{Record, Version};

// ============ Identity ============

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Accepts client writes and drives replication
    Leader,
    /// Accepts replicated writes and serves reads
    Follower,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Leader => write!(f, "leader"),
            NodeRole::Follower => write!(f, "follower"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leader" => Ok(NodeRole::Leader),
            "follower" => Ok(NodeRole::Follower),
            other => Err(Error::Config(format!("unknown role: {}", other))),
        }
    }
}

/// Identity and address of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique within a run, e.g. `leader`, `follower-1`
    pub node_id: String,
    pub role: NodeRole,
    pub host: String,
    pub port: u16,
    /// Incremented on each respawn of the same id
    pub startup_epoch: u64,
}

impl NodeDescriptor {
    /// Base URL for HTTP calls to this node
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

// ============ Node ============

/// Leader write request; follower lists are filled in by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeWriteRequest {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub sync_followers: Vec<String>,
    #[serde(default)]
    pub async_followers: Vec<String>,
    /// Tombstone write
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeWriteResponse {
    pub version: Version,
    pub sync_acks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub key: String,
    pub value: serde_json::Value,
    pub version: Version,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateResponse {
    pub accepted: bool,
    pub local_version: Version,
}

/// Read result. Tombstones travel with their version so quorum reads can
/// rank a delete against stale live values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
    pub value: serde_json::Value,
    pub version: Version,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub records: HashMap<String, Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkLoadRequest {
    pub records: HashMap<String, Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkLoadResponse {
    pub loaded: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub node_id: String,
    pub role: NodeRole,
    pub uptime_s: u64,
    pub record_count: usize,
    pub startup_epoch: u64,
    pub replication_delay_ms: u64,
}

// ============ Registry ============

/// Heartbeat body; an idempotent upsert of the sender's descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub role: NodeRole,
    pub host: String,
    pub port: u16,
    pub startup_epoch: u64,
    /// Random per-process id; changes on respawn even when the epoch is reused
    #[serde(default)]
    pub instance_id: Option<uuid::Uuid>,
}

impl HeartbeatRequest {
    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            node_id: self.node_id.clone(),
            role: self.role,
            host: self.host.clone(),
            port: self.port,
            startup_epoch: self.startup_epoch,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    /// Set when this heartbeat resurrected a pruned entry
    #[serde(default)]
    pub resurrected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterRequest {
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

// ============ Coordinator ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientWriteRequest {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientWriteResponse {
    pub version: Version,
    #[serde(default)]
    pub synced_followers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientReadResponse {
    pub value: serde_json::Value,
    pub version: Version,
    pub source_node_id: String,
}

/// Optional spawn body; the registry passes the pruned id as a hint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnRequest {
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResponse {
    pub node_id: String,
    pub port: u16,
    pub was_respawn: bool,
}

/// One follower slot as the coordinator sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerStatus {
    pub node_id: String,
    pub port: u16,
    pub replication_delay_ms: u64,
    /// In the layout's active set (catch-up finished)
    pub active: bool,
    /// Alive according to the registry
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatusResponse {
    pub leader_id: String,
    pub leader_port: u16,
    pub write_quorum: usize,
    pub read_quorum: usize,
    pub followers: Vec<FollowerStatus>,
    /// Node ids, smallest ports first
    pub sync_set: Vec<String>,
    pub async_set: Vec<String>,
    /// Node ids, largest ports first
    pub read_set: Vec<String>,
    pub live_followers: usize,
}

// ============ Gateway ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientWindowStats {
    pub client_id: String,
    pub count: u32,
    pub max_per_window: u32,
    pub window_seconds: u64,
    /// Seconds until this client's window resets
    pub window_resets_in_s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamStats {
    pub url: String,
    pub weight: u32,
    pub active_requests: usize,
    pub avg_latency_ms: f64,
    pub forwarded: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatsResponse {
    pub rate_limit: String,
    pub load_balance: String,
    pub clients: Vec<ClientWindowStats>,
    pub upstreams: Vec<UpstreamStats>,
}

// ============ Errors ============

/// Error body returned by every component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    /// Only present on 429 responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

/// Adapter turning [`Error`] into the JSON error response
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after = match &self.0 {
            Error::RateLimited { retry_after_s } => Some(*retry_after_s),
            _ => None,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
            retry_after,
        };
        (status, Json(body)).into_response()
    }
}

/// JSON extractor that rejects malformed bodies as 400 InvalidRequest
/// instead of axum's default rejection statuses
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError(Error::InvalidRequest(rejection_text(rejection)))),
        }
    }
}

fn rejection_text(rejection: JsonRejection) -> String {
    rejection.body_text()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_and_display() {
        assert_eq!("leader".parse::<NodeRole>().unwrap(), NodeRole::Leader);
        assert_eq!("follower".parse::<NodeRole>().unwrap(), NodeRole::Follower);
        assert!("observer".parse::<NodeRole>().is_err());
        assert_eq!(NodeRole::Leader.to_string(), "leader");
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let body = r#"{"key": "a", "value": "1", "shiny": true}"#;
        let req: NodeWriteRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.key, "a");
        assert!(req.sync_followers.is_empty());
        assert!(!req.deleted);
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let body = r#"{"value": "1"}"#;
        assert!(serde_json::from_str::<NodeWriteRequest>(body).is_err());
    }

    #[test]
    fn test_descriptor_base_url() {
        let desc = NodeDescriptor {
            node_id: "follower-1".into(),
            role: NodeRole::Follower,
            host: "127.0.0.1".into(),
            port: 7001,
            startup_epoch: 1,
        };
        assert_eq!(desc.base_url(), "http://127.0.0.1:7001");
    }

    #[test]
    fn test_error_response_retry_after_only_on_429() {
        let body = ErrorResponse {
            error: "x".into(),
            code: "INTERNAL".into(),
            retry_after: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("retry_after"));
    }
}
