//! Synthetic Request Load
//!
//! Optional per-request CPU cost for load-balancing demonstrations: a naive
//! recursive Fibonacci sized by `--load-factor`. Runs on a blocking thread
//! so the request workers stay free.

/// Naive recursive Fibonacci, deliberately exponential
pub fn fib(n: u32) -> u64 {
    if n < 2 {
        n as u64
    } else {
        fib(n - 1) + fib(n - 2)
    }
}

/// Burn CPU proportional to the configured load factor
pub async fn simulate(load_factor: u32) {
    if load_factor == 0 {
        return;
    }
    let _ = tokio::task::spawn_blocking(move || fib(load_factor)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fib_values() {
        assert_eq!(fib(0), 0);
        assert_eq!(fib(1), 1);
        assert_eq!(fib(10), 55);
        assert_eq!(fib(20), 6765);
    }

    #[tokio::test]
    async fn test_simulate_zero_is_free() {
        simulate(0).await;
    }
}
