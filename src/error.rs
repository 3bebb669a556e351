//! FlockKV Error Types

use thiserror::Error;

/// Result type alias for FlockKV operations
pub type Result<T> = std::result::Result<T, Error>;

/// FlockKV error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Store errors
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Replication / quorum errors
    #[error("Write quorum unavailable: {live} live followers, {required} required")]
    QuorumUnavailable { live: usize, required: usize },

    #[error("Read quorum unavailable: {answered} answered, {required} required")]
    ReadQuorumUnavailable { answered: usize, required: usize },

    #[error("Replica did not acknowledge in time: {0}")]
    ReplicaTimeout(String),

    #[error("Not the leader: {0}")]
    NotLeader(String),

    // Membership errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Network errors
    #[error("Peer unreachable at {address}: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Network error: {0}")]
    Network(String),

    /// An error response relayed from another component, status preserved
    #[error("Upstream error ({status} {code}): {message}")]
    Upstream {
        status: u16,
        code: String,
        message: String,
    },

    // Gateway errors
    #[error("Rate limit exceeded, retry after {retry_after_s:.1}s")]
    RateLimited { retry_after_s: f64 },

    #[error("No upstream available")]
    NoUpstream,

    // Process management errors
    #[error("Failed to spawn node process: {0}")]
    Spawn(String),

    #[error("Failed to kill node process: {0}")]
    Kill(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::QuorumUnavailable { .. }
                | Error::ReadQuorumUnavailable { .. }
                | Error::ReplicaTimeout(_)
                | Error::Unreachable { .. }
                | Error::Network(_)
                | Error::RateLimited { .. }
        )
    }

    /// Stable machine-readable code surfaced in error responses
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::QuorumUnavailable { .. } => "QUORUM_UNAVAILABLE",
            Error::ReadQuorumUnavailable { .. } => "READ_QUORUM_UNAVAILABLE",
            Error::ReplicaTimeout(_) => "REPLICA_TIMEOUT",
            Error::NotLeader(_) => "NOT_LEADER",
            Error::NodeNotFound(_) => "NODE_NOT_FOUND",
            Error::Unreachable { .. } => "UNREACHABLE",
            Error::ConnectionTimeout(_) => "CONNECTION_TIMEOUT",
            Error::Network(_) => "NETWORK",
            Error::Upstream { .. } => "UPSTREAM",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::NoUpstream => "NO_UPSTREAM",
            Error::Spawn(_) => "SPAWN_FAILED",
            Error::Kill(_) => "KILL_FAILED",
            Error::Io(_) => "IO",
            Error::Internal(_) => "INTERNAL",
            Error::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// HTTP status this error maps to at component boundaries
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound(_) | Error::NodeNotFound(_) => 404,
            Error::InvalidRequest(_) => 400,
            Error::RateLimited { .. } => 429,
            Error::QuorumUnavailable { .. }
            | Error::ReadQuorumUnavailable { .. }
            | Error::ReplicaTimeout(_)
            | Error::NotLeader(_)
            | Error::Unreachable { .. }
            | Error::ConnectionTimeout(_)
            | Error::NoUpstream
            | Error::ShuttingDown => 503,
            Error::Upstream { status, .. } => *status,
            Error::Network(_) => 502,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::QuorumUnavailable { live: 1, required: 2 }.is_retryable());
        assert!(Error::ConnectionTimeout("127.0.0.1:7001".into()).is_retryable());
        assert!(!Error::InvalidRequest("missing key".into()).is_retryable());
        assert!(!Error::NotFound("a".into()).is_retryable());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(Error::NotFound("k".into()).http_status(), 404);
        assert_eq!(Error::InvalidRequest("bad".into()).http_status(), 400);
        assert_eq!(Error::RateLimited { retry_after_s: 3.0 }.http_status(), 429);
        assert_eq!(
            Error::QuorumUnavailable { live: 0, required: 2 }.http_status(),
            503
        );
        let relayed = Error::Upstream {
            status: 429,
            code: "RATE_LIMITED".into(),
            message: "slow down".into(),
        };
        assert_eq!(relayed.http_status(), 429);
    }
}
