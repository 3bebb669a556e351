//! Heartbeat Loop
//!
//! Periodic registration with the registry. Failures are silently retried on
//! the next tick: a node that cannot reach the registry keeps serving data
//! traffic. The interval carries a small random jitter so a fleet spawned
//! together does not heartbeat in lockstep.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::node::NodeState;
use crate::protocol::HeartbeatRequest;

/// Start the heartbeat loop. Returns a no-op task when no registry is
/// configured.
pub fn start(state: Arc<NodeState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(registry) = state.config.registry_url.clone() else {
            tracing::info!("no registry configured; heartbeats disabled");
            return;
        };
        let base = Duration::from_secs(state.config.heartbeat_interval_s.max(1));

        loop {
            let req = HeartbeatRequest {
                node_id: state.config.id.clone(),
                role: state.role,
                host: state.config.host.clone(),
                port: state.config.port,
                startup_epoch: state.config.startup_epoch,
                instance_id: Some(state.instance_id),
            };

            match state.client.heartbeat(&registry, &req).await {
                Ok(resp) => {
                    state.mark_registered().await;
                    if resp.resurrected {
                        tracing::info!("registry had pruned us; entry resurrected");
                    }
                }
                Err(e) => {
                    tracing::debug!("heartbeat to {} failed: {}", registry, e);
                }
            }

            // +/-10% jitter around the nominal interval
            let jitter = rand::thread_rng().gen_range(0.9..=1.1);
            tokio::time::sleep(base.mul_f64(jitter)).await;
        }
    })
}

/// Graceful deregistration on drain; best effort
pub async fn deregister(state: &NodeState) {
    if let Some(registry) = &state.config.registry_url {
        match state.client.deregister(registry, &state.config.id).await {
            Ok(_) => tracing::info!("deregistered from {}", registry),
            Err(e) => tracing::warn!("deregister failed: {}", e),
        }
    }
}
