//! Global request rate limiting.
//!
//! Token bucket with burst 1, shared by every worker. Tokens accumulate
//! continuously at the configured rate and acquiring removes one; when the
//! bucket is empty the acquirer sleeps exactly until the next token is due.
//! `acquire` is a plain future, so callers can race it against the
//! termination context and abandon the wait mid-sleep.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const BURST: f64 = 1.0;

#[derive(Debug)]
struct State {
    tokens: f64,
    last_refill: Instant,
}

/// Shared token-bucket rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens per second.
    rate: f64,
    state: Mutex<State>,
}

impl RateLimiter {
    /// Create a limiter allowing `rate` acquisitions per second.
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            state: Mutex::new(State {
                tokens: BURST,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available, otherwise report how long until
    /// the next token is due.
    fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap();

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(BURST);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - state.tokens) / self.rate))
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => sleep(wait).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant as StdInstant;

    #[tokio::test]
    async fn test_first_token_is_immediate() {
        let limiter = RateLimiter::new(1.0);
        let start = StdInstant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_rate_is_enforced() {
        let limiter = RateLimiter::new(100.0);
        let start = StdInstant::now();
        // Burst of 1 plus ~100/s: 21 tokens need roughly 200ms.
        for _ in 0..21 {
            limiter.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(150),
            "21 tokens at 100/s completed in {:?}",
            elapsed
        );
        assert!(
            elapsed < Duration::from_millis(500),
            "21 tokens at 100/s took {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_shared_across_tasks() {
        let limiter = Arc::new(RateLimiter::new(50.0));
        let start = StdInstant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..3 {
                    limiter.acquire().await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        // 12 tokens at 50/s need at least ~200ms beyond the burst.
        assert!(start.elapsed() >= Duration::from_millis(180));
    }
}
