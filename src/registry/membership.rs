//! Membership Table
//!
//! The registry's authoritative view of the cluster: one entry per node id,
//! advanced by heartbeats and demoted by the pruner.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{HeartbeatRequest, NodeDescriptor};

/// Membership state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryState {
    /// Heartbeating normally
    Alive,
    /// Missed heartbeats, not yet written off
    SuspectedDead,
    /// Silent past the prune threshold
    Pruned,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryState::Alive => write!(f, "ALIVE"),
            EntryState::SuspectedDead => write!(f, "SUSPECTED-DEAD"),
            EntryState::Pruned => write!(f, "PRUNED"),
        }
    }
}

/// The registry's view of a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipEntry {
    #[serde(flatten)]
    pub descriptor: NodeDescriptor,
    pub state: EntryState,
    /// When the first heartbeat arrived
    pub registered_at: chrono::DateTime<chrono::Utc>,
    /// Per-process random id from the heartbeat body
    pub instance_id: Option<Uuid>,
    /// Last heartbeat on the monotonic clock (not serialized)
    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
}

impl MembershipEntry {
    fn new(descriptor: NodeDescriptor, instance_id: Option<Uuid>) -> Self {
        Self {
            descriptor,
            state: EntryState::Alive,
            registered_at: chrono::Utc::now(),
            instance_id,
            last_heartbeat: Some(Instant::now()),
        }
    }

    /// Time since the last heartbeat
    pub fn silence(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }
}

/// Result of processing one heartbeat
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatOutcome {
    /// The heartbeat revived a previously-pruned id
    pub resurrected: bool,
}

/// Per-state entry counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub alive: usize,
    pub suspected: usize,
    pub pruned: usize,
}

/// Authoritative membership table
pub struct MembershipTable {
    /// node_id -> entry; at most one entry per id
    entries: RwLock<HashMap<String, MembershipEntry>>,
    suspect_threshold: Duration,
    prune_threshold: Duration,
}

impl MembershipTable {
    /// Create a new table
    pub fn new(suspect_threshold: Duration, prune_threshold: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            suspect_threshold,
            prune_threshold,
        }
    }

    /// Idempotent register/heartbeat upsert. The heartbeat instant only
    /// moves forward; a pruned entry is resurrected.
    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> HeartbeatOutcome {
        let mut entries = self.entries.write().await;

        match entries.get_mut(&req.node_id) {
            Some(entry) => {
                let resurrected = entry.state == EntryState::Pruned;
                entry.descriptor = req.descriptor();
                entry.instance_id = req.instance_id;
                entry.last_heartbeat = Some(Instant::now());
                entry.state = EntryState::Alive;
                if resurrected {
                    tracing::info!(
                        "node '{}' resurrected by heartbeat (epoch {})",
                        req.node_id,
                        req.startup_epoch
                    );
                }
                HeartbeatOutcome { resurrected }
            }
            None => {
                tracing::info!(
                    "node '{}' registered: {} {}:{}",
                    req.node_id,
                    req.role,
                    req.host,
                    req.port
                );
                entries.insert(
                    req.node_id.clone(),
                    MembershipEntry::new(req.descriptor(), req.instance_id),
                );
                HeartbeatOutcome { resurrected: false }
            }
        }
    }

    /// Explicit graceful removal
    pub async fn deregister(&self, node_id: &str) -> bool {
        let removed = self.entries.write().await.remove(node_id).is_some();
        if removed {
            tracing::info!("node '{}' deregistered", node_id);
        }
        removed
    }

    /// Advance entry states on missed heartbeats; returns the descriptors
    /// of entries that transitioned to pruned on this pass.
    pub async fn check_timeouts(&self) -> Vec<NodeDescriptor> {
        let mut entries = self.entries.write().await;
        let mut newly_pruned = Vec::new();

        for entry in entries.values_mut() {
            let silence = match entry.silence() {
                Some(s) => s,
                None => continue,
            };

            if silence > self.prune_threshold && entry.state != EntryState::Pruned {
                tracing::warn!(
                    "node '{}' pruned after {:.1}s of silence",
                    entry.descriptor.node_id,
                    silence.as_secs_f64()
                );
                entry.state = EntryState::Pruned;
                newly_pruned.push(entry.descriptor.clone());
            } else if silence > self.suspect_threshold && entry.state == EntryState::Alive {
                tracing::warn!(
                    "node '{}' suspected dead ({:.1}s since heartbeat)",
                    entry.descriptor.node_id,
                    silence.as_secs_f64()
                );
                entry.state = EntryState::SuspectedDead;
            }
        }

        newly_pruned
    }

    /// Descriptors of nodes not yet pruned
    pub async fn alive(&self) -> Vec<NodeDescriptor> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.state != EntryState::Pruned)
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// All entries regardless of state
    pub async fn all(&self) -> Vec<MembershipEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    /// One entry by id
    pub async fn get(&self, node_id: &str) -> Option<MembershipEntry> {
        self.entries.read().await.get(node_id).cloned()
    }

    /// Per-state counts
    pub async fn summary(&self) -> RegistrySummary {
        let entries = self.entries.read().await;
        let mut summary = RegistrySummary {
            total: entries.len(),
            alive: 0,
            suspected: 0,
            pruned: 0,
        };
        for entry in entries.values() {
            match entry.state {
                EntryState::Alive => summary.alive += 1,
                EntryState::SuspectedDead => summary.suspected += 1,
                EntryState::Pruned => summary.pruned += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NodeRole;

    fn beat(id: &str, port: u16) -> HeartbeatRequest {
        HeartbeatRequest {
            node_id: id.to_string(),
            role: NodeRole::Follower,
            host: "127.0.0.1".to_string(),
            port,
            startup_epoch: 1,
            instance_id: Some(Uuid::new_v4()),
        }
    }

    #[tokio::test]
    async fn test_register_and_alive() {
        let table = MembershipTable::new(Duration::from_secs(3), Duration::from_secs(5));
        table.heartbeat(&beat("follower-1", 7001)).await;
        table.heartbeat(&beat("follower-2", 7002)).await;

        assert_eq!(table.alive().await.len(), 2);
        assert_eq!(table.summary().await.alive, 2);

        // Re-registering the same id stays a single entry
        table.heartbeat(&beat("follower-1", 7001)).await;
        assert_eq!(table.all().await.len(), 2);
    }

    #[tokio::test]
    async fn test_suspect_then_prune() {
        let table =
            MembershipTable::new(Duration::from_millis(50), Duration::from_millis(120));
        table.heartbeat(&beat("follower-1", 7001)).await;

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(table.check_timeouts().await.is_empty());
        assert_eq!(
            table.get("follower-1").await.unwrap().state,
            EntryState::SuspectedDead
        );
        // Still in the live set while only suspected
        assert_eq!(table.alive().await.len(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let pruned = table.check_timeouts().await;
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].node_id, "follower-1");
        assert!(table.alive().await.is_empty());

        // A second pass does not report it again
        assert!(table.check_timeouts().await.is_empty());
    }

    #[tokio::test]
    async fn test_resurrection() {
        let table =
            MembershipTable::new(Duration::from_millis(20), Duration::from_millis(40));
        table.heartbeat(&beat("follower-1", 7001)).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        table.check_timeouts().await;
        assert_eq!(
            table.get("follower-1").await.unwrap().state,
            EntryState::Pruned
        );

        let outcome = table.heartbeat(&beat("follower-1", 7001)).await;
        assert!(outcome.resurrected);
        assert_eq!(
            table.get("follower-1").await.unwrap().state,
            EntryState::Alive
        );
    }

    #[tokio::test]
    async fn test_deregister_removes_entry() {
        let table = MembershipTable::new(Duration::from_secs(3), Duration::from_secs(5));
        table.heartbeat(&beat("follower-1", 7001)).await;
        assert!(table.deregister("follower-1").await);
        assert!(!table.deregister("follower-1").await);
        assert!(table.all().await.is_empty());
    }
}
