//! Leader Fan-out
//!
//! Replication from the leader's write path. Sync followers are called in
//! parallel and all must acknowledge within the fan-out deadline; async
//! followers are fired and forgotten. Failures are surfaced, never retried
//! here: quorum policy lives in the coordinator.

use std::time::Duration;

use futures::future::join_all;

use crate::client::HttpClient;
use crate::config::SYNC_REPLICATE_TIMEOUT_S;
use crate::error::{Error, Result};
use crate::protocol::ReplicateRequest;

/// Replicate to all sync followers in parallel and wait for every ack.
/// Returns the ack count; errors if any follower failed or timed out.
/// The wall-clock cost is the slowest follower, not the sum.
pub async fn fan_out_sync(
    client: &HttpClient,
    followers: &[String],
    req: &ReplicateRequest,
) -> Result<usize> {
    if followers.is_empty() {
        return Ok(0);
    }

    let deadline = Duration::from_secs(SYNC_REPLICATE_TIMEOUT_S);
    let calls = followers.iter().map(|addr| {
        let client = client.clone();
        let req = req.clone();
        let addr = addr.clone();
        async move {
            let result = client.replicate(&addr, &req, deadline).await;
            (addr, result)
        }
    });

    let mut acks = 0;
    let mut failed: Vec<String> = Vec::new();
    for (addr, result) in join_all(calls).await {
        match result {
            Ok(resp) => {
                tracing::debug!(
                    "sync replicate '{}' v{} to {} acked (applied={})",
                    req.key,
                    req.version,
                    addr,
                    resp.accepted
                );
                acks += 1;
            }
            Err(e) => {
                tracing::warn!(
                    "sync replicate '{}' v{} to {} failed: {}",
                    req.key,
                    req.version,
                    addr,
                    e
                );
                failed.push(addr);
            }
        }
    }

    if !failed.is_empty() {
        return Err(Error::ReplicaTimeout(failed.join(", ")));
    }
    Ok(acks)
}

/// Replicate to async followers without waiting. The write has already been
/// accepted locally; these deliveries continue even if the client that
/// triggered the write is long gone.
pub fn fan_out_async(client: &HttpClient, followers: &[String], req: &ReplicateRequest) {
    let deadline = Duration::from_secs(SYNC_REPLICATE_TIMEOUT_S);
    for addr in followers {
        let client = client.clone();
        let req = req.clone();
        let addr = addr.clone();
        tokio::spawn(async move {
            match client.replicate(&addr, &req, deadline).await {
                Ok(_) => {
                    tracing::trace!("async replicate '{}' v{} to {} done", req.key, req.version, addr)
                }
                Err(e) => {
                    tracing::debug!(
                        "async replicate '{}' v{} to {} failed: {}",
                        req.key,
                        req.version,
                        addr,
                        e
                    )
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::node::{server, NodeState};
    use serde_json::json;
    use std::sync::Arc;

    /// Serve a zero-delay follower on an ephemeral port
    async fn follower() -> (String, Arc<NodeState>) {
        let config = NodeConfig {
            id: "follower-test".into(),
            role: "follower".into(),
            replication_delay_ms: 0,
            ..Default::default()
        };
        let state = Arc::new(NodeState::new(config).unwrap());
        let app = server::router(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (format!("http://{}", addr), state)
    }

    fn replicate_req(version: u64) -> ReplicateRequest {
        ReplicateRequest {
            key: "k".into(),
            value: json!("v"),
            version,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn test_sync_fan_out_collects_all_acks() {
        let (url_a, state_a) = follower().await;
        let (url_b, state_b) = follower().await;
        let client = HttpClient::new();

        let acks = fan_out_sync(&client, &[url_a, url_b], &replicate_req(1))
            .await
            .unwrap();
        assert_eq!(acks, 2);
        assert_eq!(state_a.store.version_of("k").await, 1);
        assert_eq!(state_b.store.version_of("k").await, 1);
    }

    #[tokio::test]
    async fn test_sync_fan_out_fails_on_dead_follower() {
        let (url_a, state_a) = follower().await;
        let client = HttpClient::new();

        let err = fan_out_sync(
            &client,
            &[url_a, "http://127.0.0.1:1".to_string()],
            &replicate_req(1),
        )
        .await
        .expect_err("dead follower must fail the fan-out");
        assert!(matches!(err, Error::ReplicaTimeout(_)));

        // The reachable follower still applied; nothing is rolled back
        assert_eq!(state_a.store.version_of("k").await, 1);
    }

    #[tokio::test]
    async fn test_async_fan_out_applies_eventually() {
        let (url, state) = follower().await;
        let client = HttpClient::new();

        fan_out_async(&client, &[url], &replicate_req(3));

        for _ in 0..50 {
            if state.store.version_of("k").await == 3 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("async replicate never applied");
    }

    #[tokio::test]
    async fn test_empty_sync_set_is_zero_acks() {
        let client = HttpClient::new();
        let acks = fan_out_sync(&client, &[], &replicate_req(1)).await.unwrap();
        assert_eq!(acks, 0);
    }
}
