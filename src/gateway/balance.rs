//! Load Balancing Strategies
//!
//! Upstream selection for the gateway when it fronts several nodes directly.
//! Observations (in-flight counts, latency) are the gateway's own; upstreams
//! expose nothing.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::UpstreamStats;

/// EWMA smoothing: new = (1 - ALPHA) * old + ALPHA * sample
const EWMA_ALPHA: f64 = 0.2;

/// One upstream and the gateway's observations of it
pub struct Upstream {
    pub url: String,
    pub weight: u32,
    active: AtomicUsize,
    forwarded: AtomicU64,
    /// EWMA latency in microseconds; 0 means no sample yet
    latency_ewma_us: AtomicU64,
}

impl Upstream {
    pub fn new(url: String, weight: u32) -> Self {
        Self {
            url,
            weight,
            active: AtomicUsize::new(0),
            forwarded: AtomicU64::new(0),
            latency_ewma_us: AtomicU64::new(0),
        }
    }

    /// Mark a request in flight; the guard decrements on drop so cancelled
    /// forwards never leak the counter
    pub fn begin(&self) -> ActiveGuard<'_> {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard { upstream: self }
    }

    /// Record a completed forward
    pub fn record(&self, latency: Duration) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        let sample = latency.as_micros() as u64;
        let old = self.latency_ewma_us.load(Ordering::Relaxed);
        let new = if old == 0 {
            sample
        } else {
            ((1.0 - EWMA_ALPHA) * old as f64 + EWMA_ALPHA * sample as f64) as u64
        };
        self.latency_ewma_us.store(new, Ordering::Relaxed);
    }

    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.latency_ewma_us.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn stats(&self) -> UpstreamStats {
        UpstreamStats {
            url: self.url.clone(),
            weight: self.weight,
            active_requests: self.active_requests(),
            avg_latency_ms: self.avg_latency_ms(),
            forwarded: self.forwarded.load(Ordering::Relaxed),
        }
    }
}

/// RAII in-flight marker
pub struct ActiveGuard<'a> {
    upstream: &'a Upstream,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.upstream.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Upstream selection seam
pub trait BalanceStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index of the upstream to use, None when the list is empty
    fn pick(&self, upstreams: &[Upstream]) -> Option<usize>;
}

/// Next upstream in turn
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl BalanceStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn pick(&self, upstreams: &[Upstream]) -> Option<usize> {
        if upstreams.is_empty() {
            return None;
        }
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % upstreams.len())
    }
}

/// Least-loaded: minimize active + k * avg_latency_ms, round-robin on ties
pub struct Adaptive {
    latency_weight: f64,
    tie_break: AtomicUsize,
}

impl Adaptive {
    pub fn new(latency_weight: f64) -> Self {
        Self {
            latency_weight,
            tie_break: AtomicUsize::new(0),
        }
    }

    fn score(&self, upstream: &Upstream) -> f64 {
        upstream.active_requests() as f64 + self.latency_weight * upstream.avg_latency_ms()
    }
}

impl BalanceStrategy for Adaptive {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn pick(&self, upstreams: &[Upstream]) -> Option<usize> {
        if upstreams.is_empty() {
            return None;
        }
        let scores: Vec<f64> = upstreams.iter().map(|u| self.score(u)).collect();
        let best = scores.iter().cloned().fold(f64::INFINITY, f64::min);
        let tied: Vec<usize> = scores
            .iter()
            .enumerate()
            .filter(|(_, s)| (**s - best).abs() < f64::EPSILON)
            .map(|(i, _)| i)
            .collect();
        if tied.len() == 1 {
            Some(tied[0])
        } else {
            let turn = self.tie_break.fetch_add(1, Ordering::Relaxed);
            Some(tied[turn % tied.len()])
        }
    }
}

/// Proportional selection by static capacity weight (smooth weighted
/// round-robin: every span of total-weight picks matches the ratios exactly)
pub struct Weighted {
    current: Mutex<Vec<i64>>,
}

impl Weighted {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Vec::new()),
        }
    }
}

impl Default for Weighted {
    fn default() -> Self {
        Self::new()
    }
}

impl BalanceStrategy for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn pick(&self, upstreams: &[Upstream]) -> Option<usize> {
        if upstreams.is_empty() {
            return None;
        }
        let mut current = self.current.lock().expect("weighted state lock poisoned");
        if current.len() != upstreams.len() {
            *current = vec![0; upstreams.len()];
        }

        let mut total: i64 = 0;
        for (slot, upstream) in current.iter_mut().zip(upstreams) {
            let weight = i64::from(upstream.weight.max(1));
            *slot += weight;
            total += weight;
        }
        let (selected, _) = current
            .iter()
            .enumerate()
            .max_by_key(|(_, c)| **c)?;
        current[selected] -= total;
        Some(selected)
    }
}

/// Build a strategy by name
pub fn make_strategy(name: &str, latency_weight: f64) -> Result<Box<dyn BalanceStrategy>> {
    match name {
        "round-robin" => Ok(Box::new(RoundRobin::new())),
        "adaptive" => Ok(Box::new(Adaptive::new(latency_weight))),
        "weighted" => Ok(Box::new(Weighted::new())),
        other => Err(Error::Config(format!(
            "unknown load balance strategy: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstreams(weights: &[u32]) -> Vec<Upstream> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| Upstream::new(format!("http://127.0.0.1:{}", 7001 + i), *w))
            .collect()
    }

    #[test]
    fn test_round_robin_cycles() {
        let ups = upstreams(&[1, 1, 1]);
        let strategy = RoundRobin::new();
        let picks: Vec<usize> = (0..6).map(|_| strategy.pick(&ups).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_adaptive_prefers_least_loaded() {
        let ups = upstreams(&[1, 1]);
        let strategy = Adaptive::new(0.1);

        let _busy = ups[0].begin();
        let _busier = ups[0].begin();
        assert_eq!(strategy.pick(&ups), Some(1));
    }

    #[test]
    fn test_adaptive_latency_breaks_equal_load() {
        let ups = upstreams(&[1, 1]);
        let strategy = Adaptive::new(1.0);

        ups[0].record(Duration::from_millis(50));
        ups[1].record(Duration::from_millis(5));
        assert_eq!(strategy.pick(&ups), Some(1));
    }

    #[test]
    fn test_adaptive_round_robins_on_ties() {
        let ups = upstreams(&[1, 1]);
        let strategy = Adaptive::new(0.1);
        let first = strategy.pick(&ups).unwrap();
        let second = strategy.pick(&ups).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_weighted_matches_ratio() {
        let ups = upstreams(&[2, 1]);
        let strategy = Weighted::new();
        let picks: Vec<usize> = (0..6).map(|_| strategy.pick(&ups).unwrap()).collect();

        let zeros = picks.iter().filter(|p| **p == 0).count();
        let ones = picks.iter().filter(|p| **p == 1).count();
        assert_eq!(zeros, 4);
        assert_eq!(ones, 2);
    }

    #[test]
    fn test_active_guard_releases_on_drop() {
        let ups = upstreams(&[1]);
        {
            let _guard = ups[0].begin();
            assert_eq!(ups[0].active_requests(), 1);
        }
        assert_eq!(ups[0].active_requests(), 0);
    }

    #[test]
    fn test_ewma_converges_toward_samples() {
        let ups = upstreams(&[1]);
        ups[0].record(Duration::from_millis(100));
        assert!((ups[0].avg_latency_ms() - 100.0).abs() < 1.0);

        for _ in 0..50 {
            ups[0].record(Duration::from_millis(10));
        }
        assert!(ups[0].avg_latency_ms() < 15.0);
    }

    #[test]
    fn test_empty_upstreams() {
        assert_eq!(RoundRobin::new().pick(&[]), None);
        assert_eq!(Adaptive::new(0.1).pick(&[]), None);
        assert_eq!(Weighted::new().pick(&[]), None);
    }
}
