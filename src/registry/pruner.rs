//! Pruner
//!
//! Background task that walks the membership table, advances entries that
//! went silent, and optionally requests a respawn for pruned followers after
//! a cool-down.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;

use crate::client::HttpClient;
use crate::config::RegistryConfig;
use crate::protocol::{NodeDescriptor, NodeRole};
use crate::registry::membership::{EntryState, MembershipTable};

/// Start the prune loop. Runs until the process exits.
pub fn start(
    table: Arc<MembershipTable>,
    config: RegistryConfig,
    client: HttpClient,
) -> tokio::task::JoinHandle<()> {
    if config.auto_spawn {
        let safe_delay = config.prune_threshold_s + crate::config::HEARTBEAT_TIMEOUT_S;
        if config.spawn_delay_s < safe_delay {
            tracing::warn!(
                "spawn_delay {}s is below the safe floor of {}s; a transiently \
                 delayed heartbeat can produce a duplicate (ghost) node",
                config.spawn_delay_s,
                safe_delay
            );
        }
    }

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(config.prune_interval_ms));
        loop {
            ticker.tick().await;

            let pruned = table.check_timeouts().await;
            for descriptor in pruned {
                if !config.auto_spawn || descriptor.role != NodeRole::Follower {
                    continue;
                }
                let Some(coordinator) = config.coordinator_url.clone() else {
                    tracing::warn!(
                        "auto_spawn enabled but no coordinator_url configured; \
                         cannot respawn '{}'",
                        descriptor.node_id
                    );
                    continue;
                };
                schedule_respawn(
                    Arc::clone(&table),
                    client.clone(),
                    coordinator,
                    descriptor,
                    Duration::from_secs(config.spawn_delay_s),
                );
            }
        }
    })
}

/// Wait out the cool-down, then ask the coordinator for a replacement with
/// the same id and port. The entry is re-checked after the wait: a heartbeat
/// that arrived in the meantime cancels the respawn.
fn schedule_respawn(
    table: Arc<MembershipTable>,
    client: HttpClient,
    coordinator: String,
    descriptor: NodeDescriptor,
    delay: Duration,
) {
    tokio::spawn(async move {
        tracing::info!(
            "follower '{}' pruned; respawn in {:.0}s",
            descriptor.node_id,
            delay.as_secs_f64()
        );
        tokio::time::sleep(delay).await;

        match table.get(&descriptor.node_id).await {
            Some(entry) if entry.state == EntryState::Pruned => {}
            _ => {
                tracing::info!(
                    "respawn of '{}' cancelled: entry no longer pruned",
                    descriptor.node_id
                );
                return;
            }
        }

        match client.spawn(&coordinator, Some(&descriptor.node_id)).await {
            Ok(resp) => tracing::info!(
                "respawn of '{}' requested: got '{}' on port {} (respawn={})",
                descriptor.node_id,
                resp.node_id,
                resp.port,
                resp.was_respawn
            ),
            Err(e) => tracing::warn!(
                "respawn request for '{}' failed: {}",
                descriptor.node_id,
                e
            ),
        }
    });
}
