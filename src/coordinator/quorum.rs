//! Quorum Drivers
//!
//! The only place that speaks "quorum": writes require W sync acks through
//! the leader, reads query R followers in parallel and keep the freshest
//! answer. Failed writes are never retried here; read retries stay inside
//! the live follower set and can be switched off for the strict overlap
//! demo.

use std::collections::HashSet;
use std::time::Duration;

use futures::future::join_all;

use crate::client::HttpClient;
use crate::config::READ_QUORUM_TIMEOUT_S;
use crate::coordinator::layout::ClusterLayout;
use crate::error::{Error, Result};
use crate::protocol::{
    ClientReadResponse, ClientWriteResponse, NodeWriteRequest, ReadResponse, ReplicateRequest,
};

/// Drive one quorum write through the leader
pub async fn quorum_write(
    client: &HttpClient,
    layout: &ClusterLayout,
    live: &HashSet<String>,
    key: String,
    value: serde_json::Value,
    deleted: bool,
) -> Result<ClientWriteResponse> {
    let eligible = layout.eligible(live);
    if eligible.len() < layout.write_quorum {
        return Err(Error::QuorumUnavailable {
            live: eligible.len(),
            required: layout.write_quorum,
        });
    }

    let sync_set = layout.sync_set(live);
    let async_set = layout.async_set(live);
    let sync_ids: Vec<String> = sync_set.iter().map(|f| f.node_id.clone()).collect();
    tracing::debug!(
        "write '{}': sync={:?} async={:?}",
        key,
        sync_ids,
        async_set.iter().map(|f| &f.node_id).collect::<Vec<_>>()
    );

    let request = NodeWriteRequest {
        key,
        value,
        sync_followers: sync_set.iter().map(|f| layout.follower_url(f)).collect(),
        async_followers: async_set.iter().map(|f| layout.follower_url(f)).collect(),
        deleted,
    };

    let response = client.write_node(&layout.leader_url(), &request).await?;
    Ok(ClientWriteResponse {
        version: response.version,
        synced_followers: sync_ids,
    })
}

/// One follower's answer to a read probe
struct ReadAnswer {
    node_id: String,
    url: String,
    response: Option<ReadResponse>,
}

/// Drive one quorum read: R parallel probes, freshest version wins
pub async fn quorum_read(
    client: &HttpClient,
    layout: &ClusterLayout,
    live: &HashSet<String>,
    key: &str,
    read_retry: bool,
    read_repair: bool,
) -> Result<ClientReadResponse> {
    let read_set = layout.read_set(live);
    let required = layout.read_quorum;
    if read_set.len() < required {
        return Err(Error::ReadQuorumUnavailable {
            answered: read_set.len(),
            required,
        });
    }

    let targets: Vec<(String, String)> = read_set
        .iter()
        .map(|f| (f.node_id.clone(), layout.follower_url(f)))
        .collect();
    let mut answers = probe(client, key, targets).await;

    // Policy: top up from live followers outside the read set when some
    // probes failed. Off for the strict W+R>N demonstration.
    if answers.len() < required && read_retry {
        let extras: Vec<(String, String)> = layout
            .read_extras(live)
            .iter()
            .map(|f| (f.node_id.clone(), layout.follower_url(f)))
            .collect();
        if !extras.is_empty() {
            tracing::debug!(
                "read '{}': {}/{} answers, retrying against {} extra follower(s)",
                key,
                answers.len(),
                required,
                extras.len()
            );
            answers.extend(probe(client, key, extras).await);
        }
    }

    if answers.len() < required {
        return Err(Error::ReadQuorumUnavailable {
            answered: answers.len(),
            required,
        });
    }

    // Freshest answer wins; a tombstone outranks older live values
    let winner = answers
        .iter()
        .filter_map(|a| a.response.as_ref().map(|r| (a, r)))
        .max_by_key(|(_, r)| r.version);

    let Some((source, freshest)) = winner else {
        return Err(Error::NotFound(key.to_string()));
    };
    let freshest = freshest.clone();
    let source_node_id = source.node_id.clone();

    if read_repair {
        repair_lagging(client, key, &freshest, &answers);
    }

    if freshest.deleted {
        return Err(Error::NotFound(key.to_string()));
    }
    Ok(ClientReadResponse {
        value: freshest.value,
        version: freshest.version,
        source_node_id,
    })
}

/// Query a set of followers in parallel; only successful transports count
/// as answers (a not-found is an answer, a refused connection is not)
async fn probe(
    client: &HttpClient,
    key: &str,
    targets: Vec<(String, String)>,
) -> Vec<ReadAnswer> {
    let deadline = Duration::from_secs(READ_QUORUM_TIMEOUT_S);
    let calls = targets.into_iter().map(|(node_id, url)| {
        let client = client.clone();
        let key = key.to_string();
        async move {
            match client.read(&url, &key, deadline).await {
                Ok(response) => Some(ReadAnswer {
                    node_id,
                    url,
                    response,
                }),
                Err(e) => {
                    tracing::warn!("read probe of '{}' at {} failed: {}", key, url, e);
                    None
                }
            }
        }
    });
    join_all(calls).await.into_iter().flatten().collect()
}

/// Background write of the winning record to read-set members that answered
/// with an older version. Not required for correctness.
fn repair_lagging(client: &HttpClient, key: &str, freshest: &ReadResponse, answers: &[ReadAnswer]) {
    let request = ReplicateRequest {
        key: key.to_string(),
        value: freshest.value.clone(),
        version: freshest.version,
        deleted: freshest.deleted,
    };
    for answer in answers {
        let behind = answer
            .response
            .as_ref()
            .map(|r| r.version < freshest.version)
            .unwrap_or(true);
        if !behind {
            continue;
        }
        let client = client.clone();
        let url = answer.url.clone();
        let node_id = answer.node_id.clone();
        let request = request.clone();
        tokio::spawn(async move {
            match client
                .replicate(&url, &request, Duration::from_secs(READ_QUORUM_TIMEOUT_S * 2))
                .await
            {
                Ok(_) => tracing::debug!("read repair of '{}' sent to {}", request.key, node_id),
                Err(e) => tracing::debug!("read repair to {} failed: {}", node_id, e),
            }
        });
    }
}
