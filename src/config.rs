//! FlockKV Configuration
//!
//! Configuration structures for every FlockKV component. Each section can be
//! loaded from a TOML file and overridden by CLI flags.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Replication delay applied by designated sync followers (milliseconds)
pub const SYNC_REPLICA_DELAY_MS: u64 = 500;

/// Replication delay applied by async followers (milliseconds)
pub const ASYNC_REPLICA_DELAY_MS: u64 = 5_000;

/// Deadline for the leader's sync replication fan-out (seconds)
pub const SYNC_REPLICATE_TIMEOUT_S: u64 = 60;

/// Deadline for heartbeat delivery to the registry (seconds)
pub const HEARTBEAT_TIMEOUT_S: u64 = 2;

/// Deadline for each read-quorum follower query (seconds)
pub const READ_QUORUM_TIMEOUT_S: u64 = 5;

/// Main FlockKV configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Coordinator configuration
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Port to bind for data traffic
    #[serde(default = "default_node_port")]
    pub port: u16,

    /// Host advertised in heartbeats
    #[serde(default = "default_host")]
    pub host: String,

    /// Role: "leader" or "follower"
    #[serde(default = "default_role")]
    pub role: String,

    /// Registry base URL for heartbeats (None disables heartbeats)
    #[serde(default)]
    pub registry_url: Option<String>,

    /// Replication apply delay in milliseconds (set by the coordinator at spawn)
    #[serde(default)]
    pub replication_delay_ms: u64,

    /// Startup epoch, incremented on each respawn of the same id
    #[serde(default = "default_one")]
    pub startup_epoch: u64,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,

    /// Synthetic per-request CPU cost: recursive Fibonacci depth (0 disables)
    #[serde(default)]
    pub load_factor: u32,

    /// Tokio worker threads (0 = runtime default)
    #[serde(default)]
    pub workers: usize,

    /// Optional node-level rate limit strategy ("fixed-window", "none")
    #[serde(default = "default_none_strategy")]
    pub rate_limit: String,

    /// Max requests per window when node-level rate limiting is enabled
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,

    /// Rate limit window in seconds
    #[serde(default = "default_rate_limit_window_s")]
    pub rate_limit_window_s: u64,
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Port to bind
    #[serde(default = "default_registry_port")]
    pub port: u16,

    /// Pruner wake interval in milliseconds
    #[serde(default = "default_prune_interval_ms")]
    pub prune_interval_ms: u64,

    /// Seconds of heartbeat silence before an entry is suspected dead
    #[serde(default = "default_suspect_threshold_s")]
    pub suspect_threshold_s: u64,

    /// Seconds of heartbeat silence before an entry is pruned
    #[serde(default = "default_prune_threshold_s")]
    pub prune_threshold_s: u64,

    /// Respawn pruned followers automatically
    #[serde(default)]
    pub auto_spawn: bool,

    /// Delay before a pruned follower is respawned, in seconds.
    /// Safe values satisfy spawn_delay >= prune_threshold + heartbeat interval;
    /// shorter values permit ghost-node duplication.
    #[serde(default = "default_spawn_delay_s")]
    pub spawn_delay_s: u64,

    /// Coordinator base URL for respawn requests and catch-up hints
    #[serde(default)]
    pub coordinator_url: Option<String>,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Port to bind
    #[serde(default = "default_coordinator_port")]
    pub port: u16,

    /// Number of followers to spawn at bootstrap
    #[serde(default = "default_followers")]
    pub followers: usize,

    /// Write quorum W: sync-follower acks required per write
    #[serde(default = "default_write_quorum")]
    pub write_quorum: usize,

    /// Read quorum R: followers queried per read
    #[serde(default = "default_read_quorum")]
    pub read_quorum: usize,

    /// Registry base URL
    #[serde(default = "default_registry_url")]
    pub registry_url: String,

    /// Host nodes bind and are reached on
    #[serde(default = "default_host")]
    pub host: String,

    /// Leader data port
    #[serde(default = "default_leader_port")]
    pub leader_port: u16,

    /// First follower data port; follower-K binds base + K - 1
    #[serde(default = "default_follower_base_port")]
    pub follower_base_port: u16,

    /// Retry reads against live followers outside the read set when fewer
    /// than R answers arrive (off for the strict quorum-overlap demo)
    #[serde(default = "default_true")]
    pub read_retry: bool,

    /// Background read-repair of lagging read-set members
    #[serde(default)]
    pub read_repair: bool,

    /// Spawn the node fleet at startup (off when nodes are started by hand)
    #[serde(default = "default_true")]
    pub spawn_fleet: bool,
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port to bind
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Upstream base URLs; one coordinator by default, several nodes when
    /// the gateway fronts the data plane directly
    #[serde(default = "default_upstreams")]
    pub upstreams: Vec<String>,

    /// Rate limit strategy ("fixed-window", "none")
    #[serde(default = "default_fixed_window")]
    pub rate_limit: String,

    /// Max requests per client per window
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,

    /// Rate limit window in seconds
    #[serde(default = "default_rate_limit_window_s")]
    pub rate_limit_window_s: u64,

    /// Load balance strategy ("round-robin", "adaptive", "weighted")
    #[serde(default = "default_round_robin")]
    pub load_balance: String,

    /// Static capacity weights for the weighted strategy, one per upstream
    #[serde(default)]
    pub weights: Vec<u32>,

    /// Latency factor k in the adaptive score: active + k * avg_latency_ms
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.write_quorum == 0 {
            return Err(Error::Config("write_quorum must be at least 1".into()));
        }
        if self.coordinator.read_quorum == 0 {
            return Err(Error::Config("read_quorum must be at least 1".into()));
        }
        if self.coordinator.write_quorum > self.coordinator.followers {
            return Err(Error::Config(format!(
                "write_quorum {} exceeds follower count {}",
                self.coordinator.write_quorum, self.coordinator.followers
            )));
        }
        if self.coordinator.read_quorum > self.coordinator.followers {
            return Err(Error::Config(format!(
                "read_quorum {} exceeds follower count {}",
                self.coordinator.read_quorum, self.coordinator.followers
            )));
        }
        if self.gateway.upstreams.is_empty() {
            return Err(Error::Config("gateway needs at least one upstream".into()));
        }
        if !self.gateway.weights.is_empty()
            && self.gateway.weights.len() != self.gateway.upstreams.len()
        {
            return Err(Error::Config(format!(
                "{} weights given for {} upstreams",
                self.gateway.weights.len(),
                self.gateway.upstreams.len()
            )));
        }
        Ok(())
    }

    /// Render a commented sample configuration
    pub fn sample_toml() -> String {
        let sample = Config::default();
        let body = toml::to_string_pretty(&sample).expect("default config serializes");
        format!(
            "# FlockKV configuration\n\
             # Every value below is the built-in default; delete what you do not override.\n\n{}",
            body
        )
    }

    /// True when the configured quorums guarantee read/write set overlap
    pub fn quorum_overlap(&self) -> bool {
        self.coordinator.write_quorum + self.coordinator.read_quorum > self.coordinator.followers
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            port: default_node_port(),
            host: default_host(),
            role: default_role(),
            registry_url: None,
            replication_delay_ms: 0,
            startup_epoch: 1,
            heartbeat_interval_s: default_heartbeat_interval_s(),
            load_factor: 0,
            workers: 0,
            rate_limit: default_none_strategy(),
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_s: default_rate_limit_window_s(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            port: default_registry_port(),
            prune_interval_ms: default_prune_interval_ms(),
            suspect_threshold_s: default_suspect_threshold_s(),
            prune_threshold_s: default_prune_threshold_s(),
            auto_spawn: false,
            spawn_delay_s: default_spawn_delay_s(),
            coordinator_url: None,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            port: default_coordinator_port(),
            followers: default_followers(),
            write_quorum: default_write_quorum(),
            read_quorum: default_read_quorum(),
            registry_url: default_registry_url(),
            host: default_host(),
            leader_port: default_leader_port(),
            follower_base_port: default_follower_base_port(),
            read_retry: true,
            read_repair: false,
            spawn_fleet: true,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            upstreams: default_upstreams(),
            rate_limit: default_fixed_window(),
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_s: default_rate_limit_window_s(),
            load_balance: default_round_robin(),
            weights: Vec::new(),
            latency_weight: default_latency_weight(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_node_port() -> u16 {
    7000
}

fn default_role() -> String {
    "follower".to_string()
}

fn default_one() -> u64 {
    1
}

fn default_heartbeat_interval_s() -> u64 {
    2
}

fn default_registry_port() -> u16 {
    7600
}

fn default_prune_interval_ms() -> u64 {
    1000
}

fn default_suspect_threshold_s() -> u64 {
    3
}

fn default_prune_threshold_s() -> u64 {
    5
}

fn default_spawn_delay_s() -> u64 {
    8 // prune_threshold + heartbeat interval, with margin
}

fn default_coordinator_port() -> u16 {
    7700
}

fn default_followers() -> usize {
    3
}

fn default_write_quorum() -> usize {
    2
}

fn default_read_quorum() -> usize {
    2
}

fn default_registry_url() -> String {
    "http://127.0.0.1:7600".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_leader_port() -> u16 {
    7000
}

fn default_follower_base_port() -> u16 {
    7001
}

fn default_gateway_port() -> u16 {
    7800
}

fn default_upstreams() -> Vec<String> {
    vec!["http://127.0.0.1:7700".to_string()]
}

fn default_fixed_window() -> String {
    "fixed-window".to_string()
}

fn default_none_strategy() -> String {
    "none".to_string()
}

fn default_rate_limit_max() -> u32 {
    100
}

fn default_rate_limit_window_s() -> u64 {
    60
}

fn default_round_robin() -> String {
    "round-robin".to_string()
}

fn default_latency_weight() -> f64 {
    0.1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
