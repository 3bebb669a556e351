//! FlockKV - Distributed Key/Value Store
//!
//! One binary, four components: `node`, `registry`, `coordinator`, and
//! `gateway` subcommands each run one process of the cluster.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flockkv::config::Config;
use flockkv::error::Result;

/// FlockKV - Distributed Key/Value Store
#[derive(Parser)]
#[command(name = "flockkv")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a key/value node (leader or follower)
    Node {
        /// Unique node id, e.g. leader or follower-1
        #[arg(long)]
        id: Option<String>,

        /// Data port
        #[arg(long)]
        port: Option<u16>,

        /// Host advertised in heartbeats
        #[arg(long)]
        host: Option<String>,

        /// Role: leader or follower
        #[arg(long)]
        role: Option<String>,

        /// Registry base URL
        #[arg(long)]
        registry: Option<String>,

        /// Replication apply delay in milliseconds
        #[arg(long)]
        replication_delay_ms: Option<u64>,

        /// Startup epoch assigned by the coordinator
        #[arg(long)]
        startup_epoch: Option<u64>,

        /// Synthetic per-request CPU cost (recursive Fibonacci depth)
        #[arg(long)]
        load_factor: Option<u32>,

        /// Tokio worker threads (0 = runtime default)
        #[arg(long)]
        workers: Option<usize>,

        /// Rate limit strategy: fixed-window or none
        #[arg(long)]
        rate_limit: Option<String>,

        /// Max requests per window
        #[arg(long)]
        rate_limit_max: Option<u32>,

        /// Rate limit window in seconds
        #[arg(long)]
        rate_limit_window: Option<u64>,
    },

    /// Run the membership registry
    Registry {
        /// Port to bind
        #[arg(long)]
        port: Option<u16>,

        /// Respawn pruned followers automatically
        #[arg(long)]
        auto_spawn: bool,

        /// Delay before a pruned follower is respawned, in seconds
        #[arg(long)]
        spawn_delay: Option<u64>,

        /// Seconds of silence before an entry is pruned
        #[arg(long)]
        prune_threshold: Option<u64>,

        /// Coordinator base URL for respawn requests
        #[arg(long)]
        coordinator: Option<String>,
    },

    /// Run the cluster coordinator
    Coordinator {
        /// Port to bind
        #[arg(long)]
        port: Option<u16>,

        /// Number of followers to spawn
        #[arg(long)]
        followers: Option<usize>,

        /// Write quorum W
        #[arg(long)]
        write_quorum: Option<usize>,

        /// Read quorum R
        #[arg(long)]
        read_quorum: Option<usize>,

        /// Registry base URL
        #[arg(long)]
        registry: Option<String>,

        /// Leader data port
        #[arg(long)]
        leader_port: Option<u16>,

        /// First follower data port
        #[arg(long)]
        follower_base_port: Option<u16>,

        /// Disable read retries outside the read set (strict quorum demo)
        #[arg(long)]
        no_read_retry: bool,

        /// Repair lagging read-set members in the background
        #[arg(long)]
        read_repair: bool,

        /// Do not spawn node processes; they are started externally
        #[arg(long)]
        no_spawn_fleet: bool,
    },

    /// Run the edge gateway
    Gateway {
        /// Port to bind
        #[arg(long)]
        port: Option<u16>,

        /// Upstream base URL; repeat to front several nodes directly
        #[arg(long = "upstream")]
        upstreams: Vec<String>,

        /// Rate limit strategy: fixed-window or none
        #[arg(long)]
        rate_limit: Option<String>,

        /// Max requests per client per window
        #[arg(long)]
        rate_limit_max: Option<u32>,

        /// Rate limit window in seconds
        #[arg(long)]
        rate_limit_window: Option<u64>,

        /// Load balance strategy: round-robin, adaptive, or weighted
        #[arg(long)]
        load_balance: Option<String>,

        /// Static capacity weight; repeat once per upstream
        #[arg(long = "weight")]
        weights: Vec<u32>,

        /// Latency factor k in the adaptive score
        #[arg(long)]
        latency_weight: Option<f64>,
    },

    /// Write a default configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "flockkv.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate,
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    // Exit code 2 distinguishes runtime panics from startup failures
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(2);
    }));

    let workers = match &cli.command {
        Commands::Node {
            workers: Some(n), ..
        } if *n > 0 => Some(*n),
        _ => None,
    };

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(n) = workers {
        builder.worker_threads(n);
    }
    let runtime = match builder.build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        tracing::error!("fatal: {}", e);
        std::process::exit(1);
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Node {
            id,
            port,
            host,
            role,
            registry,
            replication_delay_ms,
            startup_epoch,
            load_factor,
            workers,
            rate_limit,
            rate_limit_max,
            rate_limit_window,
        } => {
            let node = &mut config.node;
            apply(&mut node.id, id);
            apply(&mut node.port, port);
            apply(&mut node.host, host);
            apply(&mut node.role, role);
            if registry.is_some() {
                node.registry_url = registry;
            }
            apply(&mut node.replication_delay_ms, replication_delay_ms);
            apply(&mut node.startup_epoch, startup_epoch);
            apply(&mut node.load_factor, load_factor);
            apply(&mut node.workers, workers);
            apply(&mut node.rate_limit, rate_limit);
            apply(&mut node.rate_limit_max, rate_limit_max);
            apply(&mut node.rate_limit_window_s, rate_limit_window);
            flockkv::node::run(config.node).await
        }

        Commands::Registry {
            port,
            auto_spawn,
            spawn_delay,
            prune_threshold,
            coordinator,
        } => {
            let registry = &mut config.registry;
            apply(&mut registry.port, port);
            if auto_spawn {
                registry.auto_spawn = true;
            }
            apply(&mut registry.spawn_delay_s, spawn_delay);
            apply(&mut registry.prune_threshold_s, prune_threshold);
            if coordinator.is_some() {
                registry.coordinator_url = coordinator;
            }
            flockkv::registry::run(config.registry).await
        }

        Commands::Coordinator {
            port,
            followers,
            write_quorum,
            read_quorum,
            registry,
            leader_port,
            follower_base_port,
            no_read_retry,
            read_repair,
            no_spawn_fleet,
        } => {
            let coordinator = &mut config.coordinator;
            apply(&mut coordinator.port, port);
            apply(&mut coordinator.followers, followers);
            apply(&mut coordinator.write_quorum, write_quorum);
            apply(&mut coordinator.read_quorum, read_quorum);
            apply(&mut coordinator.registry_url, registry);
            apply(&mut coordinator.leader_port, leader_port);
            apply(&mut coordinator.follower_base_port, follower_base_port);
            if no_read_retry {
                coordinator.read_retry = false;
            }
            if read_repair {
                coordinator.read_repair = true;
            }
            if no_spawn_fleet {
                coordinator.spawn_fleet = false;
            }
            flockkv::coordinator::run(config.coordinator).await
        }

        Commands::Gateway {
            port,
            upstreams,
            rate_limit,
            rate_limit_max,
            rate_limit_window,
            load_balance,
            weights,
            latency_weight,
        } => {
            let gateway = &mut config.gateway;
            apply(&mut gateway.port, port);
            if !upstreams.is_empty() {
                gateway.upstreams = upstreams;
            }
            apply(&mut gateway.rate_limit, rate_limit);
            apply(&mut gateway.rate_limit_max, rate_limit_max);
            apply(&mut gateway.rate_limit_window_s, rate_limit_window);
            apply(&mut gateway.load_balance, load_balance);
            if !weights.is_empty() {
                gateway.weights = weights;
            }
            apply(&mut gateway.latency_weight, latency_weight);
            flockkv::gateway::run(config.gateway).await
        }

        Commands::Init { output } => {
            std::fs::write(&output, Config::sample_toml())?;
            println!("Wrote default configuration to {}", output.display());
            Ok(())
        }

        Commands::Validate => {
            match &cli.config {
                Some(path) => {
                    // from_file above already parsed and validated
                    println!("{} is valid", path.display());
                    Ok(())
                }
                None => Err(flockkv::Error::Config(
                    "pass --config <file> to validate".into(),
                )),
            }
        }
    }
}

fn apply<T>(target: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *target = v;
    }
}
