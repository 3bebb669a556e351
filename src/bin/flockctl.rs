//! FlockCtl - Command line tool for driving a FlockKV cluster
//!
//! Usage:
//!   flockctl status             - Show the coordinator's cluster layout
//!   flockctl write KEY VALUE    - Quorum write through the coordinator
//!   flockctl read KEY           - Quorum read through the coordinator
//!   flockctl delete KEY         - Quorum delete
//!   flockctl spawn              - Spawn (or respawn) a follower
//!   flockctl kill NODE_ID       - SIGTERM a follower process
//!   flockctl nodes              - Show the registry's membership table
//!   flockctl stats              - Show the gateway's limiter and balancer

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use serde::Deserialize;

/// FlockKV Cluster Control Tool
#[derive(Parser)]
#[command(name = "flockctl")]
#[command(about = "Control and monitor FlockKV clusters", long_about = None)]
struct Cli {
    /// Coordinator endpoint
    #[arg(long, default_value = "http://127.0.0.1:7700")]
    coordinator: String,

    /// Registry endpoint
    #[arg(long, default_value = "http://127.0.0.1:7600")]
    registry: String,

    /// Gateway endpoint
    #[arg(long, default_value = "http://127.0.0.1:7800")]
    gateway: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the cluster layout and quorum sets
    Status,
    /// Write a key through the coordinator
    Write {
        key: String,
        /// JSON value; bare words are treated as strings
        value: String,
    },
    /// Read a key through the coordinator
    Read { key: String },
    /// Delete a key through the coordinator
    Delete { key: String },
    /// Spawn a follower (respawns a pruned one when possible)
    Spawn,
    /// Kill a follower process
    Kill { node_id: String },
    /// Show the registry membership table
    Nodes,
    /// Show gateway rate limiter and balancer stats
    Stats,
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    leader_id: String,
    #[serde(default)]
    leader_port: u16,
    #[serde(default)]
    write_quorum: usize,
    #[serde(default)]
    read_quorum: usize,
    #[serde(default)]
    followers: Vec<FollowerStatus>,
    #[serde(default)]
    sync_set: Vec<String>,
    #[serde(default)]
    async_set: Vec<String>,
    #[serde(default)]
    read_set: Vec<String>,
    #[serde(default)]
    live_followers: usize,
}

#[derive(Debug, Deserialize)]
struct FollowerStatus {
    #[serde(default)]
    node_id: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    replication_delay_ms: u64,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    alive: bool,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    #[serde(default)]
    version: u64,
    #[serde(default)]
    synced_followers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    source_node_id: String,
}

#[derive(Debug, Deserialize)]
struct SpawnResponse {
    #[serde(default)]
    node_id: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    was_respawn: bool,
}

#[derive(Debug, Deserialize)]
struct MembershipEntry {
    #[serde(default)]
    node_id: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    startup_epoch: u64,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct GatewayStats {
    #[serde(default)]
    rate_limit: String,
    #[serde(default)]
    load_balance: String,
    #[serde(default)]
    clients: Vec<ClientWindow>,
    #[serde(default)]
    upstreams: Vec<UpstreamStats>,
}

#[derive(Debug, Deserialize)]
struct ClientWindow {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    count: u32,
    #[serde(default)]
    max_per_window: u32,
    #[serde(default)]
    window_resets_in_s: f64,
}

#[derive(Debug, Deserialize)]
struct UpstreamStats {
    #[serde(default)]
    url: String,
    #[serde(default)]
    weight: u32,
    #[serde(default)]
    active_requests: usize,
    #[serde(default)]
    avg_latency_ms: f64,
    #[serde(default)]
    forwarded: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    retry_after: Option<f64>,
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let http = reqwest::Client::new();

    let result = match &cli.command {
        Commands::Status => show_status(&http, &cli.coordinator).await,
        Commands::Write { key, value } => write(&http, &cli.coordinator, key, value).await,
        Commands::Read { key } => read(&http, &cli.coordinator, key).await,
        Commands::Delete { key } => delete(&http, &cli.coordinator, key).await,
        Commands::Spawn => spawn(&http, &cli.coordinator).await,
        Commands::Kill { node_id } => kill(&http, &cli.coordinator, node_id).await,
        Commands::Nodes => nodes(&http, &cli.registry).await,
        Commands::Stats => stats(&http, &cli.gateway).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

type CtlResult = anyhow::Result<()>;

async fn show_status(http: &reqwest::Client, coordinator: &str) -> CtlResult {
    let status: StatusResponse = http
        .get(format!("{}/status", coordinator))
        .send()
        .await?
        .json()
        .await?;

    println!("Cluster layout");
    println!(
        "  leader: {} (port {})  W={}  R={}  live followers: {}",
        status.leader_id,
        status.leader_port,
        status.write_quorum,
        status.read_quorum,
        status.live_followers
    );
    println!(
        "  sync set:  {:?}\n  async set: {:?}\n  read set:  {:?}",
        status.sync_set, status.async_set, status.read_set
    );
    println!();
    println!(
        "  {:<14} {:>6} {:>10} {:>8} {:>7}",
        "NODE", "PORT", "DELAY(ms)", "ACTIVE", "ALIVE"
    );
    for f in &status.followers {
        println!(
            "  {:<14} {:>6} {:>10} {:>8} {:>7}",
            f.node_id, f.port, f.replication_delay_ms, f.active, f.alive
        );
    }
    Ok(())
}

async fn write(http: &reqwest::Client, coordinator: &str, key: &str, value: &str) -> CtlResult {
    // Bare words become JSON strings so `flockctl write a 1` and
    // `flockctl write a '"x"'` both do the obvious thing
    let value: serde_json::Value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));

    let response = http
        .post(format!("{}/write", coordinator))
        .json(&serde_json::json!({"key": key, "value": value}))
        .send()
        .await?;
    if !response.status().is_success() {
        return fail(response).await;
    }
    let body: WriteResponse = response.json().await?;
    println!(
        "OK  version={}  synced={:?}",
        body.version, body.synced_followers
    );
    Ok(())
}

async fn read(http: &reqwest::Client, coordinator: &str, key: &str) -> CtlResult {
    let response = http
        .get(format!("{}/read/{}", coordinator, key))
        .send()
        .await?;
    if !response.status().is_success() {
        return fail(response).await;
    }
    let body: ReadResponse = response.json().await?;
    println!(
        "{}  (version {} from {})",
        body.value, body.version, body.source_node_id
    );
    Ok(())
}

async fn delete(http: &reqwest::Client, coordinator: &str, key: &str) -> CtlResult {
    let response = http
        .delete(format!("{}/delete/{}", coordinator, key))
        .send()
        .await?;
    if !response.status().is_success() {
        return fail(response).await;
    }
    let body: WriteResponse = response.json().await?;
    println!("OK  deleted at version={}", body.version);
    Ok(())
}

async fn spawn(http: &reqwest::Client, coordinator: &str) -> CtlResult {
    let response = http
        .post(format!("{}/spawn", coordinator))
        .send()
        .await?;
    if !response.status().is_success() {
        return fail(response).await;
    }
    let body: SpawnResponse = response.json().await?;
    println!(
        "Spawned {} on port {} ({})",
        body.node_id,
        body.port,
        if body.was_respawn { "respawn" } else { "new" }
    );
    Ok(())
}

async fn kill(http: &reqwest::Client, coordinator: &str, node_id: &str) -> CtlResult {
    let response = http
        .post(format!("{}/kill/{}", coordinator, node_id))
        .send()
        .await?;
    if !response.status().is_success() {
        return fail(response).await;
    }
    println!("Killed {}", node_id);
    Ok(())
}

async fn nodes(http: &reqwest::Client, registry: &str) -> CtlResult {
    let entries: Vec<MembershipEntry> = http
        .get(format!("{}/nodes", registry))
        .send()
        .await?
        .json()
        .await?;

    println!(
        "{:<14} {:<10} {:<22} {:>6} {:<16}",
        "NODE", "ROLE", "ADDRESS", "EPOCH", "STATE"
    );
    for e in &entries {
        println!(
            "{:<14} {:<10} {:<22} {:>6} {:<16}",
            e.node_id,
            e.role,
            format!("{}:{}", e.host, e.port),
            e.startup_epoch,
            e.state
        );
    }
    if entries.is_empty() {
        println!("(no nodes registered)");
    }
    Ok(())
}

async fn stats(http: &reqwest::Client, gateway: &str) -> CtlResult {
    let stats: GatewayStats = http
        .get(format!("{}/stats", gateway))
        .send()
        .await?
        .json()
        .await?;

    println!(
        "Gateway  rate_limit={}  load_balance={}",
        stats.rate_limit, stats.load_balance
    );
    if !stats.upstreams.is_empty() {
        println!(
            "  {:<30} {:>6} {:>7} {:>12} {:>10}",
            "UPSTREAM", "WEIGHT", "ACTIVE", "AVG_LAT(ms)", "FORWARDED"
        );
        for u in &stats.upstreams {
            println!(
                "  {:<30} {:>6} {:>7} {:>12.2} {:>10}",
                u.url, u.weight, u.active_requests, u.avg_latency_ms, u.forwarded
            );
        }
    }
    if !stats.clients.is_empty() {
        println!(
            "  {:<24} {:>7} {:>12}",
            "CLIENT", "COUNT", "RESETS_IN(s)"
        );
        for c in &stats.clients {
            println!(
                "  {:<24} {:>3}/{:<3} {:>12.1}",
                c.client_id, c.count, c.max_per_window, c.window_resets_in_s
            );
        }
    }
    Ok(())
}

async fn fail(response: reqwest::Response) -> CtlResult {
    let status = response.status();
    let body: ErrorBody = response.json().await.unwrap_or(ErrorBody {
        error: "unknown error".into(),
        code: String::new(),
        retry_after: None,
    });
    let retry = body
        .retry_after
        .map(|s| format!(" (retry after {:.1}s)", s))
        .unwrap_or_default();
    Err(anyhow!(
        "{} {} {}{}",
        status.as_u16(),
        body.code,
        body.error,
        retry
    ))
}
