//! Node Process
//!
//! One node is one OS process listening on one TCP port. In the leader role
//! it accepts client writes and fans them out to followers; in the follower
//! role it accepts replicated writes after its configured apply delay. Both
//! roles serve reads, snapshots, and bulk loads, and heartbeat the registry.

pub mod heartbeat;
pub mod load;
pub mod replication;
pub mod server;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::client::HttpClient;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::gateway::rate_limit::FixedWindowLimiter;
use crate::protocol::NodeRole;
use crate::store::RecordStore;

/// Node lifecycle phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Booting,
    Registered,
    Serving,
    Draining,
}

/// Shared node state handed to every handler
pub struct NodeState {
    pub config: NodeConfig,
    pub role: NodeRole,
    pub store: Arc<RecordStore>,
    pub client: HttpClient,
    pub started_at: Instant,
    /// Random per-process id; distinguishes respawns that reuse an epoch
    pub instance_id: Uuid,
    /// Optional node-level rate limiter
    pub limiter: Option<FixedWindowLimiter>,
    pub lifecycle: RwLock<Lifecycle>,
}

impl NodeState {
    /// Build state from config
    pub fn new(config: NodeConfig) -> Result<Self> {
        let role: NodeRole = config.role.parse()?;
        let limiter = match config.rate_limit.as_str() {
            "none" => None,
            "fixed-window" => Some(FixedWindowLimiter::new(
                config.rate_limit_max,
                std::time::Duration::from_secs(config.rate_limit_window_s),
            )),
            other => {
                return Err(Error::Config(format!(
                    "unknown rate limit strategy: {}",
                    other
                )))
            }
        };
        Ok(Self {
            config,
            role,
            store: Arc::new(RecordStore::new()),
            client: HttpClient::new(),
            started_at: Instant::now(),
            instance_id: Uuid::new_v4(),
            limiter,
            lifecycle: RwLock::new(Lifecycle::Booting),
        })
    }

    /// First successful heartbeat moved us out of booting
    pub async fn mark_registered(&self) {
        let mut phase = self.lifecycle.write().await;
        if *phase == Lifecycle::Booting {
            *phase = Lifecycle::Registered;
            tracing::info!("node '{}' registered with the registry", self.config.id);
        }
    }

    pub async fn mark_serving(&self) {
        *self.lifecycle.write().await = Lifecycle::Serving;
    }

    pub async fn mark_draining(&self) {
        *self.lifecycle.write().await = Lifecycle::Draining;
        tracing::info!("node '{}' draining", self.config.id);
    }

    pub fn uptime_s(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Run a node until interrupted
pub async fn run(config: NodeConfig) -> Result<()> {
    let port = config.port;
    let state = Arc::new(NodeState::new(config)?);
    tracing::info!(
        "starting node '{}' as {} on port {} (delay {}ms, epoch {})",
        state.config.id,
        state.role,
        port,
        state.config.replication_delay_ms,
        state.config.startup_epoch
    );

    let heartbeats = heartbeat::start(Arc::clone(&state));

    let app = server::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::Config(format!("cannot bind node port {}: {}", port, e)))?;
    state.mark_serving().await;
    tracing::info!("node '{}' serving on port {}", state.config.id, port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| Error::Network(format!("node server error: {}", e)))?;

    // Drain: tell the registry we are leaving on purpose
    state.mark_draining().await;
    heartbeats.abort();
    heartbeat::deregister(&state).await;
    tracing::info!("node '{}' exited", state.config.id);
    Ok(())
}

/// Resolve on ctrl-c or SIGTERM (the coordinator stops its fleet with
/// SIGTERM at shutdown; a kill is SIGKILL and never reaches this path)
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
