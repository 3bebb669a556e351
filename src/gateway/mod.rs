//! Edge Gateway
//!
//! Stateless ingress for clients: rate limiting, then load balancing, then
//! forwarding. Fronts a single coordinator by default, or several nodes
//! directly when configured with multiple upstreams.

pub mod balance;
pub mod rate_limit;
pub mod server;

pub use balance::{BalanceStrategy, Upstream};
pub use rate_limit::{Decision, FixedWindowLimiter, RateLimitStrategy};

use std::sync::Arc;
use std::time::Duration;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};

/// Run the gateway until interrupted
pub async fn run(config: GatewayConfig) -> Result<()> {
    if config.upstreams.is_empty() {
        return Err(Error::Config("gateway needs at least one upstream".into()));
    }

    let upstreams: Vec<Upstream> = config
        .upstreams
        .iter()
        .enumerate()
        .map(|(i, url)| {
            let weight = config.weights.get(i).copied().unwrap_or(1);
            Upstream::new(url.trim_end_matches('/').to_string(), weight)
        })
        .collect();

    let strategy = balance::make_strategy(&config.load_balance, config.latency_weight)?;
    let limiter = rate_limit::make_strategy(
        &config.rate_limit,
        config.rate_limit_max,
        Duration::from_secs(config.rate_limit_window_s),
    )?;

    tracing::info!(
        "gateway: {} upstream(s), balance={}, rate_limit={} ({}/{}s)",
        upstreams.len(),
        strategy.name(),
        limiter.as_ref().map(|l| l.name()).unwrap_or("none"),
        config.rate_limit_max,
        config.rate_limit_window_s
    );

    let state = Arc::new(server::AppState {
        upstreams,
        strategy,
        limiter,
        http: reqwest::Client::new(),
    });
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .map_err(|e| Error::Config(format!("cannot bind gateway port {}: {}", config.port, e)))?;
    tracing::info!("gateway listening on port {}", config.port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("gateway shutting down");
    })
    .await
    .map_err(|e| Error::Network(format!("gateway server error: {}", e)))?;

    Ok(())
}
