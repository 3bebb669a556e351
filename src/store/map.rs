//! Record Map
//!
//! The node-local record map. Structural access goes through one RwLock;
//! write serialization per key goes through a sharded lock table so that a
//! slow fan-out on one key never blocks writes to unrelated keys.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::record::{Record, Version};

/// Number of shards in the per-key lock table
const LOCK_SHARDS: usize = 64;

/// Concurrency-safe versioned record map
pub struct RecordStore {
    /// All records, tombstones included
    records: RwLock<HashMap<String, Record>>,
    /// Sharded per-key write locks, indexed by key hash
    locks: Vec<Arc<Mutex<()>>>,
}

impl RecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            locks: (0..LOCK_SHARDS).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    fn shard(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % LOCK_SHARDS
    }

    /// Acquire the write lock for a key. The guard is owned so it can be
    /// held across the replication fan-out.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        Arc::clone(&self.locks[self.shard(key)]).lock_owned().await
    }

    /// Get a record, tombstones included
    pub async fn get(&self, key: &str) -> Option<Record> {
        self.records.read().await.get(key).cloned()
    }

    /// Current version for a key, 0 when absent
    pub async fn version_of(&self, key: &str) -> Version {
        self.records
            .read()
            .await
            .get(key)
            .map(|r| r.version)
            .unwrap_or(0)
    }

    /// Store a record unconditionally. Callers on the write path hold the
    /// key lock and have already computed the next version.
    pub async fn put(&self, key: String, record: Record) {
        self.records.write().await.insert(key, record);
    }

    /// Apply a replicated record only if its version is strictly greater
    /// than the local one. Returns `(accepted, local_version_after)`.
    /// Compare and insert happen under one write lock, so a replica never
    /// moves a key's version backwards.
    pub async fn apply_if_newer(&self, key: &str, record: Record) -> (bool, Version) {
        let mut records = self.records.write().await;
        let local = records.get(key).map(|r| r.version).unwrap_or(0);
        if record.version > local {
            let version = record.version;
            records.insert(key.to_string(), record);
            (true, version)
        } else {
            (false, local)
        }
    }

    /// Full copy of the map, for the snapshot endpoint
    pub async fn snapshot(&self) -> HashMap<String, Record> {
        self.records.read().await.clone()
    }

    /// Load a snapshot, key by key, with the same monotonic rule as
    /// replication. Idempotent: keys already at a newer version are left
    /// alone. Returns the number of records applied.
    pub async fn bulk_load(&self, records: HashMap<String, Record>) -> usize {
        let mut map = self.records.write().await;
        let mut loaded = 0;
        for (key, record) in records {
            let local = map.get(&key).map(|r| r.version).unwrap_or(0);
            if record.version > local {
                map.insert(key, record);
                loaded += 1;
            }
        }
        loaded
    }

    /// Count of live (non-tombstone) records
    pub async fn record_count(&self) -> usize {
        self.records.read().await.values().filter(|r| !r.deleted).count()
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}
