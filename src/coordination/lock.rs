//! Distributed migration locks.
//!
//! A lock is an exclusive, TTL-bounded claim on a resource
//! (`migration:<name>`). Acquisition is one atomic conditional insert that
//! succeeds only when no unexpired record exists; an expired record and an
//! absent record are the same precondition, so a crashed holder's lock heals
//! itself once its TTL lapses.
//!
//! # Fencing
//!
//! Every grant carries a fencing token drawn from a monotonically increasing
//! sequence. A holder re-validates `(resource, token)` before committing any
//! result. A lapsed lock that was re-acquired elsewhere fails validation even
//! if the original holder never noticed it expired.
//!
//! ```text
//!  holder A: acquire(t=1) ── renew ── renew ── (stalls) ............ validate ✗
//!  holder B:                                   acquire(t=2) ── validate ✓
//! ```
//!
//! Long-running holders keep the lock alive with a [`LockKeeper`], which
//! renews every `ttl / 3` and flags the lock as lost when renewal fails.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::topology::connection::{DatabaseClient, WriteCondition, MIGRATION_LOCKS};

/// Persisted lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationLock {
    pub resource: String,
    pub holder_id: String,
    pub fencing_token: u64,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl MigrationLock {
    /// Expired locks are treated exactly like absent ones.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at <= now_ms
    }

    fn handle(&self) -> LockHandle {
        LockHandle {
            resource: self.resource.clone(),
            holder_id: self.holder_id.clone(),
            fencing_token: self.fencing_token,
            expires_at: self.expires_at,
        }
    }
}

/// Proof of ownership returned by [`LockManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub resource: String,
    pub holder_id: String,
    pub fencing_token: u64,
    /// Expiry as of the last acquire or renew.
    pub expires_at: u64,
}

/// Exclusive TTL-bounded locks.
#[async_trait]
pub trait LockManager: Send + Sync + std::fmt::Debug {
    /// Take the lock if no unexpired lock exists.
    async fn acquire(&self, resource: &str, holder_id: &str, ttl: Duration) -> Result<LockHandle>;

    /// Give the lock up. Fails with `LockNotHeld` if the handle no longer owns it.
    async fn release(&self, handle: &LockHandle) -> Result<()>;

    /// Extend the lock. Fails with `LockExpired` if it lapsed or changed hands.
    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<LockHandle>;

    /// Fencing check before a destructive step.
    async fn validate(&self, handle: &LockHandle) -> Result<()>;

    /// Current unexpired lock on a resource.
    async fn current(&self, resource: &str) -> Result<Option<MigrationLock>>;
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// Single-process lock table.
///
/// The whole check-and-insert runs under one mutex, which is the in-process
/// equivalent of a conditional insert. Expired records are swept on every
/// acquire, standing in for the TTL index of a real store.
#[derive(Debug)]
pub struct InMemoryLockManager {
    locks: Mutex<HashMap<String, MigrationLock>>,
    next_token: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            clock,
        }
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(&self, resource: &str, holder_id: &str, ttl: Duration) -> Result<LockHandle> {
        let now = self.clock.now_ms();
        let mut locks = self.locks.lock();
        locks.retain(|_, l| !l.is_expired(now));

        if let Some(existing) = locks.get(resource) {
            if !existing.is_expired(now) {
                return Err(Error::LockHeld {
                    resource: resource.to_string(),
                    holder: existing.holder_id.clone(),
                });
            }
        }

        let lock = MigrationLock {
            resource: resource.to_string(),
            holder_id: holder_id.to_string(),
            fencing_token: self.next_token.fetch_add(1, Ordering::SeqCst),
            acquired_at: now,
            expires_at: now + ttl_ms(ttl),
        };
        let handle = lock.handle();
        locks.insert(resource.to_string(), lock);
        Ok(handle)
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        let mut locks = self.locks.lock();
        match locks.get(&handle.resource) {
            Some(lock) if lock.fencing_token == handle.fencing_token => {
                locks.remove(&handle.resource);
                Ok(())
            }
            _ => Err(Error::LockNotHeld(handle.resource.clone())),
        }
    }

    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<LockHandle> {
        let now = self.clock.now_ms();
        let mut locks = self.locks.lock();
        match locks.get_mut(&handle.resource) {
            Some(lock) if lock.fencing_token == handle.fencing_token && !lock.is_expired(now) => {
                lock.expires_at = now + ttl_ms(ttl);
                Ok(lock.handle())
            }
            _ => Err(Error::LockExpired(handle.resource.clone())),
        }
    }

    async fn validate(&self, handle: &LockHandle) -> Result<()> {
        let now = self.clock.now_ms();
        match self.locks.lock().get(&handle.resource) {
            Some(lock) if lock.fencing_token == handle.fencing_token && !lock.is_expired(now) => Ok(()),
            _ => Err(Error::LockExpired(handle.resource.clone())),
        }
    }

    async fn current(&self, resource: &str) -> Result<Option<MigrationLock>> {
        let now = self.clock.now_ms();
        Ok(self
            .locks
            .lock()
            .get(resource)
            .filter(|l| !l.is_expired(now))
            .cloned())
    }
}

// ============================================================================
// Store-Backed Implementation
// ============================================================================

/// Locks stored in the `migration_locks` collection of a coordination database.
///
/// Safe across processes: every mutation is a versioned conditional write.
/// Fencing tokens are derived from the wall clock and always exceed the
/// token of the record they replace, so they keep increasing across deletes.
#[derive(Debug)]
pub struct StoreLockManager {
    client: Arc<dyn DatabaseClient>,
    clock: Arc<dyn Clock>,
    local_seq: AtomicU64,
}

impl StoreLockManager {
    pub fn new(client: Arc<dyn DatabaseClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            clock,
            local_seq: AtomicU64::new(0),
        }
    }

    async fn read_lock(&self, resource: &str) -> Result<Option<(u64, MigrationLock)>> {
        match self.client.read(MIGRATION_LOCKS, resource).await? {
            Some(v) => Ok(Some((v.version, bincode::deserialize(&v.value)?))),
            None => Ok(None),
        }
    }

    /// Token that is larger than any token issued earlier by any worker,
    /// assuming clocks within a millisecond-level skew of each other.
    fn next_token(&self, now: u64, previous: Option<u64>) -> u64 {
        let seq = self.local_seq.fetch_add(1, Ordering::SeqCst) % 1000;
        let candidate = now * 1000 + seq;
        match previous {
            Some(prev) if prev >= candidate => prev + 1,
            _ => candidate,
        }
    }
}

#[async_trait]
impl LockManager for StoreLockManager {
    async fn acquire(&self, resource: &str, holder_id: &str, ttl: Duration) -> Result<LockHandle> {
        let now = self.clock.now_ms();
        let existing = self.read_lock(resource).await?;

        let (condition, previous_token) = match &existing {
            Some((_, lock)) if !lock.is_expired(now) => {
                return Err(Error::LockHeld {
                    resource: resource.to_string(),
                    holder: lock.holder_id.clone(),
                });
            }
            Some((version, lock)) => (WriteCondition::Version(*version), Some(lock.fencing_token)),
            None => (WriteCondition::Absent, None),
        };

        let lock = MigrationLock {
            resource: resource.to_string(),
            holder_id: holder_id.to_string(),
            fencing_token: self.next_token(now, previous_token),
            acquired_at: now,
            expires_at: now + ttl_ms(ttl),
        };
        let written = self
            .client
            .write_conditional(MIGRATION_LOCKS, resource, condition, Some(bincode::serialize(&lock)?))
            .await?;
        if !written {
            // Someone else won the conditional write.
            let holder = match self.read_lock(resource).await? {
                Some((_, l)) => l.holder_id,
                None => "unknown".to_string(),
            };
            return Err(Error::LockHeld {
                resource: resource.to_string(),
                holder,
            });
        }
        Ok(lock.handle())
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        match self.read_lock(&handle.resource).await? {
            Some((version, lock)) if lock.fencing_token == handle.fencing_token => {
                let removed = self
                    .client
                    .write_conditional(MIGRATION_LOCKS, &handle.resource, WriteCondition::Version(version), None)
                    .await?;
                if removed {
                    Ok(())
                } else {
                    Err(Error::LockNotHeld(handle.resource.clone()))
                }
            }
            _ => Err(Error::LockNotHeld(handle.resource.clone())),
        }
    }

    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<LockHandle> {
        let now = self.clock.now_ms();
        match self.read_lock(&handle.resource).await? {
            Some((version, mut lock)) if lock.fencing_token == handle.fencing_token && !lock.is_expired(now) => {
                lock.expires_at = now + ttl_ms(ttl);
                let written = self
                    .client
                    .write_conditional(
                        MIGRATION_LOCKS,
                        &handle.resource,
                        WriteCondition::Version(version),
                        Some(bincode::serialize(&lock)?),
                    )
                    .await?;
                if written {
                    Ok(lock.handle())
                } else {
                    Err(Error::LockExpired(handle.resource.clone()))
                }
            }
            _ => Err(Error::LockExpired(handle.resource.clone())),
        }
    }

    async fn validate(&self, handle: &LockHandle) -> Result<()> {
        let now = self.clock.now_ms();
        match self.read_lock(&handle.resource).await? {
            Some((_, lock)) if lock.fencing_token == handle.fencing_token && !lock.is_expired(now) => Ok(()),
            _ => Err(Error::LockExpired(handle.resource.clone())),
        }
    }

    async fn current(&self, resource: &str) -> Result<Option<MigrationLock>> {
        let now = self.clock.now_ms();
        Ok(self
            .read_lock(resource)
            .await?
            .map(|(_, l)| l)
            .filter(|l| !l.is_expired(now)))
    }
}

// ============================================================================
// Lock Keeper
// ============================================================================

/// Background renewal of a held lock.
///
/// Renews every `ttl / 3`. A `LockExpired` answer marks the lock lost and
/// stops renewal; transient errors are retried on the next tick until the
/// last known expiry passes.
#[derive(Debug)]
pub struct LockKeeper {
    manager: Arc<dyn LockManager>,
    handle: Arc<Mutex<LockHandle>>,
    lost: Arc<AtomicBool>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl LockKeeper {
    /// Start renewing `handle`.
    pub fn spawn(manager: Arc<dyn LockManager>, handle: LockHandle, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let handle = Arc::new(Mutex::new(handle));
        let lost = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = {
            let manager = manager.clone();
            let handle = handle.clone();
            let lost = lost.clone();
            let period = (ttl / 3).max(Duration::from_millis(1));

            tokio::spawn(async move {
                let mut timer = tokio::time::interval(period);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                timer.tick().await;

                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = timer.tick() => {
                            let current = handle.lock().clone();
                            match manager.renew(&current, ttl).await {
                                Ok(renewed) => {
                                    tracing::trace!(
                                        resource = %renewed.resource,
                                        expires_at = renewed.expires_at,
                                        "Renewed lock"
                                    );
                                    *handle.lock() = renewed;
                                }
                                Err(Error::LockExpired(resource)) => {
                                    tracing::warn!(%resource, "Lock lost, renewal refused");
                                    lost.store(true, Ordering::SeqCst);
                                    break;
                                }
                                Err(e) => {
                                    if current.expires_at <= clock.now_ms() {
                                        tracing::warn!(
                                            resource = %current.resource,
                                            error = %e,
                                            "Lock lapsed while renewal kept failing"
                                        );
                                        lost.store(true, Ordering::SeqCst);
                                        break;
                                    }
                                    tracing::debug!(
                                        resource = %current.resource,
                                        error = %e,
                                        "Lock renewal failed, retrying next tick"
                                    );
                                }
                            }
                        }
                    }
                }
            })
        };

        Self {
            manager,
            handle,
            lost,
            shutdown_tx,
            task,
        }
    }

    /// Latest handle (updated by each renewal).
    pub fn handle(&self) -> LockHandle {
        self.handle.lock().clone()
    }

    /// Whether renewal detected the lock was lost.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Fencing check: the lock must still be ours.
    pub async fn validate(&self) -> Result<()> {
        if self.is_lost() {
            return Err(Error::LockExpired(self.handle().resource));
        }
        let handle = self.handle();
        let result = self.manager.validate(&handle).await;
        if matches!(result, Err(Error::LockExpired(_))) {
            self.lost.store(true, Ordering::SeqCst);
        }
        result
    }

    /// Stop renewing and return the final handle.
    pub async fn stop(self) -> LockHandle {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
        let handle = self.handle.lock().clone();
        handle
    }
}
