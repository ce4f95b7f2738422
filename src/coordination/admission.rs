//! Admission control.
//!
//! Two bounded slot pools gate concurrency:
//!
//! ```text
//!                 ┌────────────────────────────┐
//!  submit ──────► │ migration slots (MAX_      │──► PENDING → LOCKING
//!                 │ PARALLEL_MIGRATIONS)       │
//!                 └────────────────────────────┘
//!                 ┌────────────────────────────┐    ┌──────────────────┐
//!  shard task ──► │ shard slots (MAX_PARALLEL_ │──► │ throttle bucket  │──► execute
//!                 │ SHARDS), shared by all     │    │ per DatabaseType │
//!                 └────────────────────────────┘    └──────────────────┘
//! ```
//!
//! A migration holds its slot from admission until it reaches a terminal
//! status. Shard slots are held while one shard runs, retries included.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::rate_limiter::ShardThrottle;
use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::types::DatabaseType;

/// Bounded counting semaphore with explicit and RAII release.
#[derive(Debug)]
pub struct SlotPool {
    name: &'static str,
    capacity: usize,
    semaphore: Semaphore,
    in_use: AtomicUsize,
}

impl SlotPool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            semaphore: Semaphore::new(capacity),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Take a slot if one is free. Never waits.
    pub fn try_acquire_slot(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.in_use.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(_) => false,
        }
    }

    /// Return a slot taken with [`try_acquire_slot`](Self::try_acquire_slot).
    ///
    /// Releasing more slots than were taken is ignored.
    pub fn release_slot(&self) {
        let released = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if released {
            self.semaphore.add_permits(1);
        } else {
            tracing::warn!(pool = self.name, "Released a slot that was never acquired");
        }
    }

    /// Take a slot wrapped in a guard that releases on drop.
    pub fn try_guard(self: &Arc<Self>) -> Option<SlotGuard> {
        self.try_acquire_slot().then(|| SlotGuard { pool: Arc::clone(self) })
    }

    /// Wait for a slot. Fails only if the pool was closed.
    pub async fn acquire(self: &Arc<Self>) -> Result<SlotGuard> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::Internal(format!("{} slot pool is closed", self.name)))?;
        permit.forget();
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(SlotGuard { pool: Arc::clone(self) })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Releases its slot when dropped.
#[derive(Debug)]
pub struct SlotGuard {
    pool: Arc<SlotPool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release_slot();
    }
}

/// Migration and shard admission plus optional throttling.
#[derive(Debug)]
pub struct AdmissionController {
    migrations: Arc<SlotPool>,
    shards: Arc<SlotPool>,
    throttle: Option<ShardThrottle>,
}

impl AdmissionController {
    pub fn new(max_parallel_migrations: usize, max_parallel_shards: usize) -> Self {
        Self {
            migrations: Arc::new(SlotPool::new("migrations", max_parallel_migrations)),
            shards: Arc::new(SlotPool::new("shards", max_parallel_shards)),
            throttle: None,
        }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        let controller = Self::new(config.max_parallel_migrations, config.max_parallel_shards);
        if config.throttle_migrations {
            controller.with_throttle(config.throttle_rate)
        } else {
            controller
        }
    }

    /// Rate-limit shard operations to `ops_per_sec` per database type.
    pub fn with_throttle(mut self, ops_per_sec: u64) -> Self {
        self.throttle = Some(ShardThrottle::new(ops_per_sec));
        self
    }

    /// Non-blocking: take a migration slot if running count < capacity.
    pub fn try_acquire_slot(&self) -> bool {
        self.migrations.try_acquire_slot()
    }

    /// Give back a migration slot.
    pub fn release_slot(&self) {
        self.migrations.release_slot()
    }

    /// Take a migration slot as a guard.
    pub fn try_admit(&self) -> Option<SlotGuard> {
        self.migrations.try_guard()
    }

    /// Wait for a shard slot.
    pub async fn acquire_shard_slot(&self) -> Result<SlotGuard> {
        self.shards.acquire().await
    }

    /// Wait for a throttle token. No-op when throttling is disabled.
    pub async fn throttle(&self, database_type: DatabaseType) -> Duration {
        match &self.throttle {
            Some(throttle) => throttle.acquire(database_type).await,
            None => Duration::ZERO,
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.throttle.is_some()
    }

    /// Migrations currently holding a slot.
    pub fn running(&self) -> usize {
        self.migrations.in_use()
    }

    pub fn migration_capacity(&self) -> usize {
        self.migrations.capacity()
    }

    /// Shard executions currently holding a slot.
    pub fn shards_in_flight(&self) -> usize {
        self.shards.in_use()
    }
}
