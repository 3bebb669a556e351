//! Cluster Coordinator
//!
//! Owns the cluster layout: one leader plus N followers, the W/R quorum
//! parameters, and the node processes themselves. All quorum decisions are
//! made here; nodes only execute the fan-out they are handed.

pub mod catchup;
pub mod layout;
pub mod quorum;
pub mod server;
pub mod spawner;

pub use layout::{ClusterLayout, FollowerSlot};

use std::sync::Arc;
use std::time::Duration;

use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::protocol::NodeRole;

/// Run the coordinator until interrupted. With `spawn_fleet` set this boots
/// the leader and follower processes first; otherwise the fleet is assumed
/// to be started externally on the configured ports.
pub async fn run(config: CoordinatorConfig) -> Result<()> {
    if config.write_quorum == 0 || config.write_quorum > config.followers {
        return Err(Error::Config(format!(
            "write_quorum {} invalid for {} followers",
            config.write_quorum, config.followers
        )));
    }
    if config.read_quorum == 0 || config.read_quorum > config.followers {
        return Err(Error::Config(format!(
            "read_quorum {} invalid for {} followers",
            config.read_quorum, config.followers
        )));
    }
    if config.write_quorum + config.read_quorum <= config.followers {
        tracing::warn!(
            "W={} + R={} <= N={}: read and sync sets need not overlap; stale \
             reads are possible inside the async replication window",
            config.write_quorum,
            config.read_quorum,
            config.followers
        );
    }

    let mut layout = ClusterLayout::new(
        config.host.clone(),
        "leader".to_string(),
        config.leader_port,
        config.write_quorum,
        config.read_quorum,
    )
    .with_initial_followers(config.follower_base_port, config.followers);

    let mut spawner = spawner::Spawner::new(config.host.clone(), config.registry_url.clone());
    let client = crate::client::HttpClient::new();

    if config.spawn_fleet {
        tracing::info!(
            "booting fleet: leader on {} plus {} followers from {}",
            config.leader_port,
            config.followers,
            config.follower_base_port
        );
        spawner.spawn_node("leader", config.leader_port, NodeRole::Leader, 0)?;
        for slot in layout.followers().to_vec() {
            spawner.spawn_node(&slot.node_id, slot.port, NodeRole::Follower, slot.delay_ms)?;
        }

        let leader_url = layout.leader_url();
        spawner::wait_healthy(&client, &leader_url, Duration::from_secs(10)).await?;
        for slot in layout.followers().to_vec() {
            let url = layout.follower_url(&slot);
            spawner::wait_healthy(&client, &url, Duration::from_secs(10)).await?;
        }
        tracing::info!("fleet healthy");
    }

    // Bootstrap starts from an empty leader, so there is nothing to catch
    // up; every follower enters the active set directly
    for slot in layout.followers().to_vec() {
        layout.set_active(&slot.node_id, true);
    }

    let state = Arc::new(server::AppState::new(config.clone(), layout, spawner));
    state.refresh_liveness().await;
    let refresher = server::start_liveness_refresh(Arc::clone(&state));

    let app = server::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .map_err(|e| {
            Error::Config(format!("cannot bind coordinator port {}: {}", config.port, e))
        })?;
    tracing::info!(
        "coordinator listening on port {} (N={}, W={}, R={})",
        config.port,
        config.followers,
        config.write_quorum,
        config.read_quorum
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("coordinator shutting down");
        })
        .await
        .map_err(|e| Error::Network(format!("coordinator server error: {}", e)))?;

    refresher.abort();
    state.spawner.lock().await.kill_all();
    Ok(())
}
