//! Follower Catch-up
//!
//! Brings a freshly spawned or resurrected follower to a recent state before
//! it re-enters replication: fetch the leader's full snapshot, push it into
//! the follower's bulk-load endpoint (which bypasses the apply delay), and
//! only then let the caller mark the follower active. Writes accepted while
//! this runs may be missed; subsequent replication closes the gap.

use crate::client::HttpClient;
use crate::error::Result;
use crate::protocol::BulkLoadRequest;

/// Copy the leader's state into the follower. Returns the number of records
/// the follower actually applied; safe to re-run at any time since the
/// bulk-load never regresses a newer key.
pub async fn run(client: &HttpClient, leader_url: &str, follower_url: &str) -> Result<usize> {
    let snapshot = client.snapshot(leader_url).await?;
    let total = snapshot.records.len();
    if total == 0 {
        tracing::debug!("catch-up skipped: leader snapshot is empty");
        return Ok(0);
    }

    let response = client
        .bulk_load(
            follower_url,
            &BulkLoadRequest {
                records: snapshot.records,
            },
        )
        .await?;
    tracing::info!(
        "catch-up: {} of {} snapshot records applied to {}",
        response.loaded,
        total,
        follower_url
    );
    Ok(response.loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::node::{server as node_server, NodeState};
    use crate::store::Record;
    use serde_json::json;
    use std::sync::Arc;

    async fn node(role: &str, delay_ms: u64) -> (String, Arc<NodeState>) {
        let config = NodeConfig {
            id: format!("{}-catchup", role),
            role: role.into(),
            replication_delay_ms: delay_ms,
            ..Default::default()
        };
        let state = Arc::new(NodeState::new(config).unwrap());
        let app = node_server::router(Arc::clone(&state));
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

    #[tokio::test]
    async fn test_catchup_copies_full_state() {
        let (leader_url, leader) = node("leader", 0).await;
        let (follower_url, follower) = node("follower", 5_000).await;
        let client = HttpClient::new();

        leader.store.put("d".into(), Record::new(json!("1"), 1)).await;
        leader.store.put("e".into(), Record::new(json!("2"), 1)).await;
        leader.store.put("f".into(), Record::new(json!("3"), 1)).await;

        let loaded = run(&client, &leader_url, &follower_url).await.unwrap();
        assert_eq!(loaded, 3);

        // The slow apply delay did not apply: bulk-load is urgent
        assert_eq!(follower.store.record_count().await, 3);
        assert_eq!(follower.store.version_of("f").await, 1);
    }

    #[tokio::test]
    async fn test_catchup_idempotent_never_regresses() {
        let (leader_url, leader) = node("leader", 0).await;
        let (follower_url, follower) = node("follower", 0).await;
        let client = HttpClient::new();

        leader.store.put("k".into(), Record::new(json!("old"), 2)).await;
        // The follower already saw a newer write for this key
        follower
            .store
            .put("k".into(), Record::new(json!("newer"), 5))
            .await;

        let loaded = run(&client, &leader_url, &follower_url).await.unwrap();
        assert_eq!(loaded, 0);
        let record = follower.store.get("k").await.unwrap();
        assert_eq!(record.value, json!("newer"));
        assert_eq!(record.version, 5);

        // Running it again changes nothing
        let loaded = run(&client, &leader_url, &follower_url).await.unwrap();
        assert_eq!(loaded, 0);
    }

    #[tokio::test]
    async fn test_catchup_empty_leader_is_noop() {
        let (leader_url, _leader) = node("leader", 0).await;
        let (follower_url, follower) = node("follower", 0).await;
        let client = HttpClient::new();

        let loaded = run(&client, &leader_url, &follower_url).await.unwrap();
        assert_eq!(loaded, 0);
        assert_eq!(follower.store.record_count().await, 0);
    }
}
