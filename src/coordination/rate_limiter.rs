//! Token-bucket throttling of shard operations.
//!
//! When throttling is enabled every shard operation takes one token from the
//! bucket of its database type before it runs. All migrations targeting the
//! same database type share one bucket, so the aggregate rate against e.g.
//! the PostgreSQL fleet stays at `THROTTLE_RATE` ops/sec no matter how many
//! migrations are active.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::DatabaseType;

/// Token-bucket rate limiter.
#[derive(Debug)]
pub struct TokenBucketRateLimiter {
    /// Maximum tokens (burst capacity).
    capacity: u64,
    /// Tokens added per second.
    refill_rate: u64,
    /// Current token count.
    tokens: AtomicU64,
    /// Last refill time.
    last_refill: Mutex<Instant>,
}

impl TokenBucketRateLimiter {
    /// Create a limiter of `ops_per_sec`.
    ///
    /// `burst` defaults to one second worth of operations.
    pub fn new(ops_per_sec: u64, burst: Option<u64>) -> Self {
        let refill_rate = ops_per_sec.max(1);
        let capacity = burst.unwrap_or(refill_rate).max(1);
        Self {
            capacity,
            refill_rate,
            tokens: AtomicU64::new(capacity),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    /// Try to take `n` tokens without waiting.
    pub fn try_acquire(&self, n: u64) -> bool {
        self.refill();
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| current.checked_sub(n))
            .is_ok()
    }

    /// Take `n` tokens, waiting for refill if necessary.
    ///
    /// Returns the duration waited.
    pub async fn acquire(&self, n: u64) -> Duration {
        let n = n.min(self.capacity);
        let start = Instant::now();

        loop {
            if self.try_acquire(n) {
                return start.elapsed();
            }
            let current = self.tokens.load(Ordering::Acquire);
            let needed = n.saturating_sub(current);
            let wait_secs = needed as f64 / self.refill_rate as f64;
            tokio::time::sleep(Duration::from_secs_f64(wait_secs.max(0.001))).await;
        }
    }

    /// Refill tokens based on elapsed time.
    fn refill(&self) {
        let mut last = self.last_refill.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(*last);

        let new_tokens = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;
        if new_tokens > 0 {
            let _ = self
                .tokens
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    Some(current.saturating_add(new_tokens).min(self.capacity))
                });
            // Only advance by the time the granted tokens account for.
            let accounted = Duration::from_secs_f64(new_tokens as f64 / self.refill_rate as f64);
            *last += accounted;
            if self.tokens.load(Ordering::Acquire) == self.capacity {
                *last = now;
            }
        }
    }

    /// Current token count.
    pub fn available(&self) -> u64 {
        self.refill();
        self.tokens.load(Ordering::Acquire)
    }

    /// Configured rate in operations per second.
    pub fn rate(&self) -> u64 {
        self.refill_rate
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// Per-database-type buckets shared by all migrations.
#[derive(Debug)]
pub struct ShardThrottle {
    rate: u64,
    buckets: RwLock<HashMap<DatabaseType, Arc<TokenBucketRateLimiter>>>,
}

impl ShardThrottle {
    pub fn new(ops_per_sec: u64) -> Self {
        Self {
            rate: ops_per_sec,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Bucket for a database type, created on first use.
    pub fn bucket(&self, database_type: DatabaseType) -> Arc<TokenBucketRateLimiter> {
        if let Some(bucket) = self.buckets.read().get(&database_type) {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write();
        buckets
            .entry(database_type)
            .or_insert_with(|| Arc::new(TokenBucketRateLimiter::new(self.rate, None)))
            .clone()
    }

    /// Wait for permission to run one shard operation.
    pub async fn acquire(&self, database_type: DatabaseType) -> Duration {
        let waited = self.bucket(database_type).acquire(1).await;
        if !waited.is_zero() {
            tracing::debug!(
                database_type = %database_type,
                waited_ms = waited.as_millis() as u64,
                "Shard operation throttled"
            );
        }
        waited
    }
}
