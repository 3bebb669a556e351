//! Cluster Layout
//!
//! The coordinator's authoritative shape: one leader, an ordered follower
//! list, and the quorum parameters. Set selection is deliberately
//! deterministic: the sync set is the W live followers with the smallest
//! ports and the read set the R with the largest, so the two overlap in at
//! least one follower exactly when W + R > N.

use std::collections::HashSet;

use crate::config::{ASYNC_REPLICA_DELAY_MS, SYNC_REPLICA_DELAY_MS};

/// One follower as the coordinator tracks it
#[derive(Debug, Clone)]
pub struct FollowerSlot {
    pub node_id: String,
    pub port: u16,
    /// Apply delay handed to the process at spawn
    pub delay_ms: u64,
    /// False while the follower is catching up
    pub active: bool,
}

/// The coordinator's cluster shape
#[derive(Debug, Clone)]
pub struct ClusterLayout {
    pub host: String,
    pub leader_id: String,
    pub leader_port: u16,
    pub write_quorum: usize,
    pub read_quorum: usize,
    /// Kept sorted by ascending port
    followers: Vec<FollowerSlot>,
}

impl ClusterLayout {
    /// Create a layout with no followers yet
    pub fn new(
        host: String,
        leader_id: String,
        leader_port: u16,
        write_quorum: usize,
        read_quorum: usize,
    ) -> Self {
        Self {
            host,
            leader_id,
            leader_port,
            write_quorum,
            read_quorum,
            followers: Vec::new(),
        }
    }

    /// Build the initial follower list: ports base..base+n-1, the W smallest
    /// designated sync (fast delay), the rest async (slow delay)
    pub fn with_initial_followers(mut self, base_port: u16, count: usize) -> Self {
        for index in 0..count {
            let delay_ms = if index < self.write_quorum {
                SYNC_REPLICA_DELAY_MS
            } else {
                ASYNC_REPLICA_DELAY_MS
            };
            self.upsert_follower(FollowerSlot {
                node_id: format!("follower-{}", index + 1),
                port: base_port + index as u16,
                delay_ms,
                active: false,
            });
        }
        self
    }

    /// Insert or replace a follower slot, keeping port order
    pub fn upsert_follower(&mut self, slot: FollowerSlot) {
        self.followers.retain(|f| f.node_id != slot.node_id);
        self.followers.push(slot);
        self.followers.sort_by_key(|f| f.port);
    }

    pub fn follower(&self, node_id: &str) -> Option<&FollowerSlot> {
        self.followers.iter().find(|f| f.node_id == node_id)
    }

    pub fn followers(&self) -> &[FollowerSlot] {
        &self.followers
    }

    /// Flip a follower's active flag; returns false for unknown ids
    pub fn set_active(&mut self, node_id: &str, active: bool) -> bool {
        match self.followers.iter_mut().find(|f| f.node_id == node_id) {
            Some(slot) => {
                slot.active = active;
                true
            }
            None => false,
        }
    }

    /// Highest port in use, leader included; for allocating the next one
    pub fn max_port(&self) -> u16 {
        self.followers
            .iter()
            .map(|f| f.port)
            .chain(std::iter::once(self.leader_port))
            .max()
            .unwrap_or(self.leader_port)
    }

    pub fn leader_url(&self) -> String {
        format!("http://{}:{}", self.host, self.leader_port)
    }

    pub fn follower_url(&self, slot: &FollowerSlot) -> String {
        format!("http://{}:{}", self.host, slot.port)
    }

    /// Followers that are active in the layout and live per the registry,
    /// ascending port order
    pub fn eligible<'a>(&'a self, live: &HashSet<String>) -> Vec<&'a FollowerSlot> {
        self.followers
            .iter()
            .filter(|f| f.active && live.contains(&f.node_id))
            .collect()
    }

    /// W live followers with the smallest ports
    pub fn sync_set<'a>(&'a self, live: &HashSet<String>) -> Vec<&'a FollowerSlot> {
        let mut eligible = self.eligible(live);
        eligible.truncate(self.write_quorum);
        eligible
    }

    /// Every live follower outside the sync set
    pub fn async_set<'a>(&'a self, live: &HashSet<String>) -> Vec<&'a FollowerSlot> {
        self.eligible(live)
            .into_iter()
            .skip(self.write_quorum)
            .collect()
    }

    /// R live followers with the largest ports, largest first
    pub fn read_set<'a>(&'a self, live: &HashSet<String>) -> Vec<&'a FollowerSlot> {
        let eligible = self.eligible(live);
        eligible
            .into_iter()
            .rev()
            .take(self.read_quorum)
            .collect()
    }

    /// Live followers outside the read set, for the read-retry policy
    pub fn read_extras<'a>(&'a self, live: &HashSet<String>) -> Vec<&'a FollowerSlot> {
        let eligible = self.eligible(live);
        let keep = eligible.len().saturating_sub(self.read_quorum);
        eligible.into_iter().take(keep).collect()
    }
}
