//! Per-address token-bucket admission control.
//!
//! Buckets refill lazily: each request computes the tokens earned since the
//! bucket was last touched instead of relying on a background scheduler
//! tick. Locking is two-level, a map-level reader/writer lock for lookup
//! and a per-bucket mutex for token state, so the read-mostly fast path
//! never contends on a global lock. A background reaper deletes buckets
//! idle past the visitor timeout; a returning address simply recreates its
//! bucket at full capacity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// Token state for a single remote address.
struct ClientBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Tokens available after `elapsed` of inactivity, clamped to capacity.
fn refill(tokens: f64, elapsed: Duration, rate: f64, capacity: f64) -> f64 {
    (tokens + elapsed.as_secs_f64() * rate).min(capacity)
}

/// Token-bucket rate limiter keyed by remote address.
pub struct RateLimiter {
    clients: RwLock<HashMap<String, Arc<Mutex<ClientBucket>>>>,
    rate: f64,
    capacity: f64,
}

impl RateLimiter {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            rate,
            capacity,
        }
    }

    /// Fetch the bucket for `addr`, creating it at full capacity on first
    /// sight. Fast path takes only the read lock; creation double-checks
    /// under the write lock.
    fn bucket(&self, addr: &str) -> Arc<Mutex<ClientBucket>> {
        {
            let clients = self.clients.read().expect("rate limiter lock poisoned");
            if let Some(bucket) = clients.get(addr) {
                return bucket.clone();
            }
        }

        let mut clients = self.clients.write().expect("rate limiter lock poisoned");
        clients
            .entry(addr.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ClientBucket {
                    tokens: self.capacity,
                    last_refill: Instant::now(),
                }))
            })
            .clone()
    }

    /// Admit or reject one request from `addr`.
    pub fn allow(&self, addr: &str) -> bool {
        let bucket = self.bucket(addr);
        let mut bucket = bucket.lock().expect("bucket lock poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        if elapsed > Duration::ZERO {
            bucket.tokens = refill(bucket.tokens, elapsed, self.rate, self.capacity);
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets that have not been touched within `visitor_timeout`.
    pub fn reap(&self, visitor_timeout: Duration) {
        let mut clients = self.clients.write().expect("rate limiter lock poisoned");
        clients.retain(|_, bucket| {
            let bucket = bucket.lock().expect("bucket lock poisoned");
            bucket.last_refill.elapsed() <= visitor_timeout
        });
    }

    /// Run the reaper in the background every `cleanup_interval`.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        cleanup_interval: Duration,
        visitor_timeout: Duration,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                ticker.tick().await;
                limiter.reap(visitor_timeout);
            }
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.clients.read().expect("rate limiter lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_up_to_capacity_then_rejected() {
        let limiter = RateLimiter::new(0.5, 5.0);
        for i in 0..5 {
            assert!(limiter.allow("10.0.0.1"), "request {} within burst", i);
        }
        assert!(!limiter.allow("10.0.0.1"), "sixth request rejected");
    }

    #[test]
    fn test_addresses_have_independent_buckets() {
        let limiter = RateLimiter::new(0.5, 1.0);
        assert!(limiter.allow("10.0.0.1"));
        assert!(!limiter.allow("10.0.0.1"));
        assert!(limiter.allow("10.0.0.2"));
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_refill_is_monotonic_and_clamped() {
        // Quiescence earns elapsed * rate tokens, up to capacity.
        let refilled = refill(1.0, Duration::from_secs(4), 0.5, 5.0);
        assert!((refilled - 3.0).abs() < 1e-9);

        let clamped = refill(4.0, Duration::from_secs(60), 0.5, 5.0);
        assert!((clamped - 5.0).abs() < 1e-9);

        let untouched = refill(2.0, Duration::ZERO, 0.5, 5.0);
        assert!((untouched - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_tokens_refill_after_quiescence() {
        // High rate so the test does not sleep for seconds.
        let limiter = RateLimiter::new(50.0, 2.0);
        assert!(limiter.allow("10.0.0.9"));
        assert!(limiter.allow("10.0.0.9"));
        assert!(!limiter.allow("10.0.0.9"));

        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.allow("10.0.0.9"));
    }

    #[tokio::test]
    async fn test_reaper_drops_idle_buckets() {
        let limiter = RateLimiter::new(0.5, 5.0);
        limiter.allow("10.0.0.1");
        limiter.allow("10.0.0.2");
        assert_eq!(limiter.bucket_count(), 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        limiter.reap(Duration::from_millis(10));
        assert_eq!(limiter.bucket_count(), 0);

        // A returning address starts over at full capacity.
        assert!(limiter.allow("10.0.0.1"));
        assert_eq!(limiter.bucket_count(), 1);
    }
}
