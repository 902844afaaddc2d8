//! In-memory sliding-window limiter for the NL query endpoint, where
//! every request spends model tokens. Per-process only; put a real edge
//! limiter in front when running more than one instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<String, Vec<Instant>>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window_secs: u64) -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            max_requests,
            window: Duration::from_secs(window_secs),
        }
    }

    /// Records an attempt for `key` (client IP) and reports whether it is
    /// within the window budget.
    pub async fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.write().await;

        let hits = windows.entry(key.to_string()).or_default();
        hits.retain(|&t| now.duration_since(t) < self.window);

        if hits.len() < self.max_requests {
            hits.push(now);
            true
        } else {
            false
        }
    }

    /// Drops keys whose whole window has expired. Called periodically so
    /// one-off clients don't accumulate forever.
    pub async fn prune(&self) {
        let now = Instant::now();
        let mut windows = self.windows.write().await;

        windows.retain(|_, hits| {
            hits.retain(|&t| now.duration_since(t) < self.window);
            !hits.is_empty()
        });

        tracing::debug!(active_keys = windows.len(), "rate limiter pruned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocks_after_budget_is_spent() {
        let limiter = RateLimiter::new(2, 60);

        assert!(limiter.allow("10.0.0.1").await);
        assert!(limiter.allow("10.0.0.1").await);
        assert!(!limiter.allow("10.0.0.1").await);

        // Other clients are unaffected.
        assert!(limiter.allow("10.0.0.2").await);
    }

    #[tokio::test]
    async fn prune_drops_expired_windows() {
        let limiter = RateLimiter::new(5, 1);

        limiter.allow("a").await;
        limiter.allow("b").await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        limiter.prune().await;

        assert_eq!(limiter.windows.read().await.len(), 0);
    }
}
