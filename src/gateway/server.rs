//! Gateway Ingress
//!
//! The single client entry point. Requests pass the middleware chain in
//! order: rate limiter, load balancer, forward. Upstream responses come back
//! verbatim, non-200 statuses included, so a 429 or 503 survives the hop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::client::transport_error;
use crate::error::Error;
use crate::gateway::balance::{BalanceStrategy, Upstream};
use crate::gateway::rate_limit::{client_identity, Decision, RateLimitStrategy};
use crate::protocol::{ApiError, GatewayStatsResponse};

/// Deadline on forwarded calls; generous enough for a full leader fan-out
const FORWARD_TIMEOUT: Duration = Duration::from_secs(65);

/// Shared gateway state
pub struct AppState {
    pub upstreams: Vec<Upstream>,
    pub strategy: Box<dyn BalanceStrategy>,
    pub limiter: Option<Box<dyn RateLimitStrategy>>,
    pub http: reqwest::Client,
}

/// Build the gateway router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/write", post(handle_write))
        .route("/read/:key", get(handle_read))
        .route("/delete/:key", delete(handle_delete))
        .route("/stats", get(handle_stats))
        .route("/graduate", get(handle_graduate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_write(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(limited) = check_limit(&state, &headers, peer).await {
        return limited.into_response();
    }
    forward(&state, reqwest::Method::POST, "/write", Some(body)).await
}

async fn handle_read(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    if let Err(limited) = check_limit(&state, &headers, peer).await {
        return limited.into_response();
    }
    forward(&state, reqwest::Method::GET, &format!("/read/{}", key), None).await
}

async fn handle_delete(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    if let Err(limited) = check_limit(&state, &headers, peer).await {
        return limited.into_response();
    }
    forward(
        &state,
        reqwest::Method::DELETE,
        &format!("/delete/{}", key),
        None,
    )
    .await
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> Json<GatewayStatsResponse> {
    let clients = match &state.limiter {
        Some(limiter) => limiter.stats().await,
        None => Vec::new(),
    };
    Json(GatewayStatsResponse {
        rate_limit: state
            .limiter
            .as_ref()
            .map(|l| l.name())
            .unwrap_or("none")
            .to_string(),
        load_balance: state.strategy.name().to_string(),
        clients,
        upstreams: state.upstreams.iter().map(|u| u.stats()).collect(),
    })
}

async fn handle_graduate() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "graduated": true,
        "message": "Congratulations! Your cluster survived you."
    }))
}

async fn check_limit(
    state: &AppState,
    headers: &HeaderMap,
    peer: SocketAddr,
) -> Result<(), ApiError> {
    if let Some(limiter) = &state.limiter {
        let client = client_identity(headers, Some(peer));
        if let Decision::Limited { retry_after } = limiter.check(&client).await {
            tracing::debug!("rate limited '{}' for {:.1}s", client, retry_after.as_secs_f64());
            return Err(ApiError(Error::RateLimited {
                retry_after_s: retry_after.as_secs_f64(),
            }));
        }
    }
    Ok(())
}

/// Pick an upstream, issue the request, and relay status and body verbatim
async fn forward(
    state: &AppState,
    method: reqwest::Method,
    path: &str,
    body: Option<Bytes>,
) -> Response {
    // With a single upstream (the coordinator deployment) the balancer is moot
    let index = if state.upstreams.len() == 1 {
        Some(0)
    } else {
        state.strategy.pick(&state.upstreams)
    };
    let Some(index) = index else {
        return ApiError(Error::NoUpstream).into_response();
    };
    let upstream = &state.upstreams[index];
    let _in_flight = upstream.begin();

    let url = format!("{}{}", upstream.url, path);
    let started = Instant::now();
    let mut request = state.http.request(method, &url).timeout(FORWARD_TIMEOUT);
    if let Some(bytes) = body {
        request = request
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes);
    }

    match request.send().await {
        Ok(response) => {
            upstream.record(started.elapsed());
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/json")
                .to_string();
            match response.bytes().await {
                Ok(bytes) => {
                    (status, [(header::CONTENT_TYPE, content_type)], bytes).into_response()
                }
                Err(e) => ApiError(Error::Network(format!("reading {}: {}", url, e)))
                    .into_response(),
            }
        }
        Err(e) => {
            // Failed forwards still count as latency samples so the adaptive
            // strategy steers away from a struggling upstream
            upstream.record(started.elapsed());
            ApiError(transport_error(&url, e)).into_response()
        }
    }
}
