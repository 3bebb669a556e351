//! Rate Limiting
//!
//! Fixed-window rate limiting keyed by client identity. The window resets at
//! fixed boundaries, which knowingly admits up to twice the per-window
//! maximum across a boundary; that behavior is part of the contract here and
//! must not be smoothed over.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::error::{Error, Result};
use crate::protocol::ClientWindowStats;

/// Header a client may use to identify itself ahead of its source address
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Allowed,
    Limited { retry_after: Duration },
}

/// Pluggable rate limiting seam for the gateway middleware chain
#[async_trait]
pub trait RateLimitStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Account one request for this client and decide
    async fn check(&self, client_id: &str) -> Decision;

    /// Current per-client window state, for /stats
    async fn stats(&self) -> Vec<ClientWindowStats>;
}

struct WindowState {
    window_start: Instant,
    count: u32,
}

/// Fixed-window limiter: per client, a counter that resets `window` after
/// the first request that opened the window.
pub struct FixedWindowLimiter {
    max_per_window: u32,
    window: Duration,
    clients: Mutex<HashMap<String, WindowState>>,
}

impl FixedWindowLimiter {
    /// Create a limiter
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Account one request at the current instant
    pub fn check(&self, client_id: &str) -> Decision {
        self.check_at(client_id, Instant::now())
    }

    /// Account one request at an explicit instant
    pub fn check_at(&self, client_id: &str, now: Instant) -> Decision {
        let mut clients = self.clients.lock().expect("rate limiter lock poisoned");
        let state = clients.entry(client_id.to_string()).or_insert(WindowState {
            window_start: now,
            count: 0,
        });

        if now.duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.count = 0;
        }

        if state.count < self.max_per_window {
            state.count += 1;
            Decision::Allowed
        } else {
            let elapsed = now.duration_since(state.window_start);
            Decision::Limited {
                retry_after: self.window.saturating_sub(elapsed),
            }
        }
    }

    /// Snapshot of all tracked windows
    pub fn window_stats(&self) -> Vec<ClientWindowStats> {
        let clients = self.clients.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        clients
            .iter()
            .map(|(id, state)| {
                let elapsed = now.duration_since(state.window_start);
                ClientWindowStats {
                    client_id: id.clone(),
                    count: state.count,
                    max_per_window: self.max_per_window,
                    window_seconds: self.window.as_secs(),
                    window_resets_in_s: self.window.saturating_sub(elapsed).as_secs_f64(),
                }
            })
            .collect()
    }
}

#[async_trait]
impl RateLimitStrategy for FixedWindowLimiter {
    fn name(&self) -> &'static str {
        "fixed-window"
    }

    async fn check(&self, client_id: &str) -> Decision {
        FixedWindowLimiter::check(self, client_id)
    }

    async fn stats(&self) -> Vec<ClientWindowStats> {
        self.window_stats()
    }
}

/// Build a rate limit strategy by name; `None` disables limiting
pub fn make_strategy(
    name: &str,
    max_per_window: u32,
    window: Duration,
) -> Result<Option<Box<dyn RateLimitStrategy>>> {
    match name {
        "none" => Ok(None),
        "fixed-window" => Ok(Some(Box::new(FixedWindowLimiter::new(
            max_per_window,
            window,
        )))),
        other => Err(Error::Config(format!(
            "unknown rate limit strategy: {}",
            other
        ))),
    }
}

/// Resolve the client identity: explicit header first, source address next
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| peer.map(|p| p.ip().to_string()))
        .unwrap_or_else(|| "anonymous".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_boundary() {
        let limiter = FixedWindowLimiter::new(5, Duration::from_secs(10));
        let t0 = Instant::now();

        // First M requests in the window succeed
        for _ in 0..5 {
            assert_eq!(limiter.check_at("c", t0), Decision::Allowed);
        }

        // M+1..2M are rejected with a hint in (0, window]
        for _ in 0..5 {
            match limiter.check_at("c", t0 + Duration::from_secs(3)) {
                Decision::Limited { retry_after } => {
                    assert!(retry_after > Duration::ZERO);
                    assert!(retry_after <= Duration::from_secs(10));
                    assert_eq!(retry_after, Duration::from_secs(7));
                }
                Decision::Allowed => panic!("should be limited"),
            }
        }

        // At the boundary the counter resets
        assert_eq!(
            limiter.check_at("c", t0 + Duration::from_secs(10)),
            Decision::Allowed
        );
    }

    #[test]
    fn test_double_burst_across_boundary() {
        // The documented fixed-window weakness: 2*max requests can land in
        // a span shorter than one window when they straddle the boundary.
        let limiter = FixedWindowLimiter::new(3, Duration::from_secs(10));
        let t0 = Instant::now();

        for _ in 0..3 {
            assert_eq!(
                limiter.check_at("c", t0 + Duration::from_secs(9)),
                Decision::Allowed
            );
        }
        for _ in 0..3 {
            assert_eq!(
                limiter.check_at("c", t0 + Duration::from_secs(10)),
                Decision::Allowed
            );
        }
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_secs(10));
        let t0 = Instant::now();

        assert_eq!(limiter.check_at("a", t0), Decision::Allowed);
        assert_eq!(limiter.check_at("b", t0), Decision::Allowed);
        assert!(matches!(
            limiter.check_at("a", t0),
            Decision::Limited { .. }
        ));
    }

    #[test]
    fn test_client_identity_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_ID_HEADER, "team-7".parse().unwrap());
        let peer: SocketAddr = "10.0.0.9:55555".parse().unwrap();

        assert_eq!(client_identity(&headers, Some(peer)), "team-7");
        assert_eq!(client_identity(&HeaderMap::new(), Some(peer)), "10.0.0.9");
        assert_eq!(client_identity(&HeaderMap::new(), None), "anonymous");
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        assert!(make_strategy("sliding-window", 5, Duration::from_secs(10)).is_err());
        assert!(make_strategy("none", 5, Duration::from_secs(10))
            .unwrap()
            .is_none());
    }
}
