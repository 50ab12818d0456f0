//! Sharded token-bucket rate limiter keyed by client identity (§4.5).
//!
//! Each shard owns its own lock; entries within a shard are wrapped in their
//! own mutex so a cache hit only needs the shard's read lock plus the
//! entry's own lock, never a write lock on the whole shard.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

/// Token bucket rate, in requests/minute. Burst is `max(1, rate*10/60)`
/// expressed in whole tokens/second.
struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl TokenBucket {
    fn new(rpm: u32) -> Self {
        let rate_per_sec = f64::from(rpm) / 60.0;
        let now = Instant::now();
        Self {
            rate_per_sec,
            burst: (rate_per_sec * 10.0).max(1.0),
            tokens: (rate_per_sec * 10.0).max(1.0),
            last_refill: now,
            last_access: now,
        }
    }

    fn set_limit(&mut self, rpm: u32) {
        self.rate_per_sec = f64::from(rpm) / 60.0;
        self.burst = (self.rate_per_sec * 10.0).max(1.0);
        self.tokens = self.tokens.min(self.burst);
    }

    fn try_consume(&mut self, n: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
        self.last_refill = now;
        self.last_access = now;

        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }
}

struct Shard {
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
}

/// Fixed-shard-count limiter. `allow`/`allow_n` never fail; a stopped
/// limiter denies every call.
pub struct ShardedRateLimiter {
    shards: Vec<Shard>,
    default_rpm: u32,
    stopped: AtomicBool,
}

impl ShardedRateLimiter {
    pub fn new(shard_count: usize, default_rpm: u32) -> Arc<Self> {
        let shard_count = shard_count.max(1);
        let shards =
            (0..shard_count).map(|_| Shard { buckets: RwLock::new(HashMap::new()) }).collect();
        Arc::new(Self { shards, default_rpm, stopped: AtomicBool::new(false) })
    }

    fn shard_for(&self, key: &str) -> &Shard {
        let mut hasher = ahash::AHasher::default();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    fn bucket_for(&self, key: &str, default_rpm: u32) -> Arc<Mutex<TokenBucket>> {
        let shard = self.shard_for(key);
        if let Some(bucket) = shard.buckets.read().get(key) {
            return Arc::clone(bucket);
        }
        Arc::clone(
            shard
                .buckets
                .write()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(default_rpm)))),
        )
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1.0)
    }

    pub fn allow_n(&self, key: &str, n: f64) -> bool {
        if self.stopped.load(Ordering::Relaxed) {
            return false;
        }
        self.bucket_for(key, self.default_rpm).lock().try_consume(n)
    }

    /// Overrides the rate/burst for one key, creating it if absent.
    pub fn set_limit(&self, key: &str, rpm: u32) {
        self.bucket_for(key, rpm).lock().set_limit(rpm);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    /// Drops entries idle longer than `max_age` within one shard.
    fn evict_shard(&self, index: usize, max_age: Duration) {
        self.shards[index]
            .buckets
            .write()
            .retain(|_, bucket| bucket.lock().last_access.elapsed() <= max_age);
    }

    /// Spawns the periodic eviction task: every `period`, every shard is
    /// swept concurrently for entries older than `max_age`.
    pub fn spawn_eviction_task(
        self: Arc<Self>,
        period: Duration,
        max_age: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let sweeps = (0..self.shards.len()).map(|index| {
                    let limiter = Arc::clone(&self);
                    tokio::spawn(async move {
                        limiter.evict_shard(index, max_age);
                    })
                });
                futures::future::join_all(sweeps).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_burst_then_denies() {
        let limiter = ShardedRateLimiter::new(4, 60); // 1 token/sec, burst 10
        for _ in 0..10 {
            assert!(limiter.allow("client-a"));
        }
        assert!(!limiter.allow("client-a"));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = ShardedRateLimiter::new(4, 60);
        for _ in 0..10 {
            assert!(limiter.allow("client-a"));
        }
        assert!(limiter.allow("client-b"));
    }

    #[test]
    fn stopped_limiter_denies_everything() {
        let limiter = ShardedRateLimiter::new(4, 6000);
        limiter.stop();
        assert!(!limiter.allow("client-a"));
    }

    #[test]
    fn set_limit_overrides_burst() {
        let limiter = ShardedRateLimiter::new(4, 60);
        limiter.set_limit("client-a", 6000); // burst now 1000
        for _ in 0..50 {
            assert!(limiter.allow("client-a"));
        }
    }

    #[tokio::test]
    async fn eviction_removes_idle_entries() {
        let limiter = ShardedRateLimiter::new(2, 60);
        limiter.allow("client-a");
        let index = {
            let mut hasher = ahash::AHasher::default();
            "client-a".hash(&mut hasher);
            (hasher.finish() as usize) % limiter.shards.len()
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        limiter.evict_shard(index, Duration::from_millis(1));
        assert!(limiter.shards[index].buckets.read().is_empty());
    }
}
