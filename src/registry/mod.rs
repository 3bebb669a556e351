//! Membership Registry
//!
//! Tracks the live node set via heartbeats, prunes silent nodes, and can
//! request replacements for pruned followers after a cool-down.

pub mod membership;
pub mod pruner;
pub mod server;

pub use membership::{EntryState, MembershipEntry, MembershipTable, RegistrySummary};

use std::sync::Arc;
use std::time::Duration;

use crate::client::HttpClient;
use crate::config::RegistryConfig;
use crate::error::{Error, Result};

/// Run the registry until interrupted
pub async fn run(config: RegistryConfig) -> Result<()> {
    let table = Arc::new(MembershipTable::new(
        Duration::from_secs(config.suspect_threshold_s),
        Duration::from_secs(config.prune_threshold_s),
    ));
    let client = HttpClient::new();

    let pruner = pruner::start(Arc::clone(&table), config.clone(), client.clone());

    let state = Arc::new(server::AppState {
        table,
        coordinator_url: config.coordinator_url.clone(),
        client,
    });
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .map_err(|e| Error::Config(format!("cannot bind registry port {}: {}", config.port, e)))?;
    tracing::info!(
        "registry listening on port {} (prune threshold {}s, auto_spawn={})",
        config.port,
        config.prune_threshold_s,
        config.auto_spawn
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("registry shutting down");
        })
        .await
        .map_err(|e| Error::Network(format!("registry server error: {}", e)))?;

    pruner.abort();
    Ok(())
}
