//! Execution of one admitted migration.
//!
//! ```text
//!  drive(id)
//!    ├─ PENDING ─CAS─► LOCKING
//!    ├─ acquire lock (backoff, bounded)            ── exhausted ──► FAILED(LOCK_TIMEOUT)
//!    ├─ LockKeeper renews every ttl/3
//!    ├─ LOCKING ─CAS─► RUNNING
//!    ├─ resolve shards                             ── none ───────► FAILED(SHARD_NOT_FOUND)
//!    ├─ for each unfinished shard:
//!    │     check cancel / timeout / lock           ── interrupt ──► stop scheduling
//!    │     wait shard slot, spawn shard task (retries + throttle)
//!    │     commit finished shard results after a fencing check
//!    ├─ drain in-flight shards
//!    ├─ lock lost? re-acquire with backoff         ── held elsewhere ► leave record
//!    │     └─ resume from the persisted shards     ── lost too often ► FAILED(LOCK_EXPIRED)
//!    ├─ RUNNING ─CAS─► aggregate | CANCELLED | FAILED(TIMEOUT)
//!    └─ release lock (always, while held)
//! ```
//!
//! Nothing is written to the record without the lock once RUNNING. A run
//! that dies on a store error leaves the record where it was.
//! [`recover`](super::MigrationOrchestrator::recover) picks it up later.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::Instrument;

use super::executor::ShardTask;
use super::orchestrator::Inner;
use crate::coordination::{EventType, LockHandle, LockKeeper, MigrationEvent, SlotGuard, TransitionUpdate};
use crate::error::{Error, Result};
use crate::topology::ShardEndpoint;
use crate::types::{Migration, MigrationFailure, MigrationId, MigrationStatus, ShardProgress, ShardStatus};

/// Why scheduling stopped before every shard ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    TimedOut,
    LockLost,
}

impl Interrupt {
    fn as_str(&self) -> &'static str {
        match self {
            Interrupt::Cancelled => "cancelled",
            Interrupt::TimedOut => "timed_out",
            Interrupt::LockLost => "lock_lost",
        }
    }
}

/// How a stretch of work under one lock grant ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tenure {
    /// The record is terminal or was left to another writer.
    Done,
    /// The lock lapsed or changed hands mid-run.
    Lost,
}

/// Result of one shard task, committed by the driver.
#[derive(Debug)]
struct ShardOutcome {
    progress: ShardProgress,
    error: Option<Error>,
    duration: Duration,
}

impl Inner {
    /// Run a migration to a terminal status (or until it has to be left for recovery).
    pub(crate) async fn drive(self: &Arc<Self>, id: MigrationId) {
        let cancel = self
            .cancel_flags
            .entry(id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();
        if let Err(e) = self.run(id, &cancel).await {
            tracing::error!(
                migration_id = %id,
                code = e.code(),
                error = %e,
                "Migration run aborted, record left for recovery"
            );
        }
        self.cancel_flags.remove(&id);
    }

    async fn run(self: &Arc<Self>, id: MigrationId, cancel: &AtomicBool) -> Result<()> {
        let mut migration = self.store.get(id).await?;
        if migration.status.is_terminal() {
            tracing::debug!(migration_id = %id, status = %migration.status, "Already terminal");
            return Ok(());
        }
        let recovered = migration.status != MigrationStatus::Pending;

        if migration.status == MigrationStatus::Pending {
            if cancel.load(Ordering::SeqCst) || migration.cancel_requested {
                self.finish(&migration, MigrationStatus::Cancelled, None).await?;
                return Ok(());
            }
            migration = match self.advance(&migration, MigrationStatus::Locking, TransitionUpdate::new()).await? {
                Some(m) => m,
                None => return Ok(()),
            };
        }

        let mut handle = match self.acquire_lock(&migration, Some(cancel)).await {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                self.finish(&migration, MigrationStatus::Cancelled, None).await?;
                return Ok(());
            }
            Err(Error::LockHeld { holder, .. }) if recovered => {
                tracing::warn!(
                    migration_id = %id,
                    status = %migration.status,
                    %holder,
                    "Recovered migration is locked by another worker, leaving it alone"
                );
                return Ok(());
            }
            Err(e) => {
                let failure = match &e {
                    Error::LockHeld { resource, holder } => MigrationFailure::new(
                        "LOCK_TIMEOUT",
                        format!(
                            "lock on {} still held by {} after {} attempts",
                            resource, holder, self.config.retry.max_retries
                        ),
                    ),
                    other => MigrationFailure::from_error(other),
                };
                self.finish(&migration, MigrationStatus::Failed, Some(failure)).await?;
                return Ok(());
            }
        };

        let mut lapses = 0;
        loop {
            let keeper = LockKeeper::spawn(self.locks.clone(), handle, self.config.lock_ttl, self.clock.clone());
            let result = if lapses >= self.config.retry.max_retries {
                self.expire(id, lapses).await
            } else {
                self.run_locked(id, &keeper, cancel).await
            };
            let held = keeper.stop().await;

            match result {
                Ok(Tenure::Lost) => {
                    lapses += 1;
                    handle = match self.reacquire_lock(id, &held, lapses).await? {
                        Some(handle) => handle,
                        None => return Ok(()),
                    };
                }
                other => {
                    self.release_lock(id, &held).await;
                    return other.map(|_| ());
                }
            }
        }
    }

    /// Take the lock back after losing it mid-run.
    ///
    /// `None` means someone else owns the migration now and the record is
    /// left to them.
    async fn reacquire_lock(&self, id: MigrationId, lost: &LockHandle, lapses: u32) -> Result<Option<LockHandle>> {
        self.emit(
            MigrationEvent::new(id, EventType::LockLost)
                .with("resource", &lost.resource)
                .with("fencing_token", lost.fencing_token),
        )
        .await;
        tracing::warn!(
            migration_id = %id,
            resource = %lost.resource,
            fencing_token = lost.fencing_token,
            lapses,
            "Migration lock lost, trying to take it back"
        );

        let migration = self.store.get(id).await?;
        if migration.status.is_terminal() {
            tracing::debug!(migration_id = %id, status = %migration.status, "Finished by the new lock holder");
            return Ok(None);
        }
        match self.acquire_lock(&migration, None).await {
            Ok(handle) => Ok(handle),
            Err(Error::LockHeld { holder, .. }) => {
                tracing::warn!(
                    migration_id = %id,
                    status = %migration.status,
                    %holder,
                    "Migration taken over by another worker, leaving it alone"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Give up on a migration whose lock keeps lapsing. Runs under a fresh grant.
    async fn expire(&self, id: MigrationId, lapses: u32) -> Result<Tenure> {
        let migration = self.store.get(id).await?;
        if !migration.status.is_terminal() {
            let failure = MigrationFailure::new(
                "LOCK_EXPIRED",
                format!("lock on {} lost {} times", migration.lock_resource(), lapses),
            );
            self.finish(&migration, MigrationStatus::Failed, Some(failure)).await?;
        }
        Ok(Tenure::Done)
    }

    /// Compare-and-swap from the record's current status and log the event.
    ///
    /// Returns `None` when someone else moved the record first.
    async fn advance(
        &self,
        migration: &Migration,
        to: MigrationStatus,
        update: TransitionUpdate,
    ) -> Result<Option<Migration>> {
        match self.store.transition(migration.id, &[migration.status], to, update).await {
            Ok(updated) => {
                self.emit(MigrationEvent::status_changed(migration.id, migration.status, to))
                    .await;
                tracing::debug!(migration_id = %migration.id, from = %migration.status, %to, "Status changed");
                Ok(Some(updated))
            }
            Err(Error::InvalidTransition { from, .. }) => {
                tracing::debug!(
                    migration_id = %migration.id,
                    expected = %migration.status,
                    actual = %from,
                    %to,
                    "Lost transition race"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Move to a terminal status and account for it.
    async fn finish(
        &self,
        migration: &Migration,
        to: MigrationStatus,
        failure: Option<MigrationFailure>,
    ) -> Result<Option<Migration>> {
        let mut update = TransitionUpdate::new();
        if let Some(failure) = failure.clone() {
            update = update.error(failure);
        }
        let Some(done) = self.advance(migration, to, update).await? else {
            return Ok(None);
        };

        let duration_ms = done.duration_ms();
        self.metrics
            .record_terminal(to, duration_ms.map(Duration::from_millis));
        let succeeded = done.count_shards(ShardStatus::Succeeded);
        let failed = done.count_shards(ShardStatus::Failed);
        match &failure {
            Some(failure) => tracing::error!(
                migration_id = %done.id,
                status = %to,
                code = %failure.code,
                error = %failure.message,
                shards_succeeded = succeeded,
                shards_failed = failed,
                duration_ms,
                "Migration finished with errors"
            ),
            None => tracing::info!(
                migration_id = %done.id,
                status = %to,
                shards_succeeded = succeeded,
                duration_ms,
                "Migration finished"
            ),
        }
        Ok(Some(done))
    }

    /// Acquire the migration lock with bounded backoff.
    ///
    /// `Ok(None)` means cancellation was requested while waiting.
    async fn acquire_lock(&self, migration: &Migration, cancel: Option<&AtomicBool>) -> Result<Option<LockHandle>> {
        let resource = migration.lock_resource();
        let policy = &self.config.retry;
        let mut attempt = 0;

        loop {
            if cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
                return Ok(None);
            }
            match self
                .locks
                .acquire(&resource, &self.config.worker_id, self.config.lock_ttl)
                .await
            {
                Ok(handle) => {
                    self.emit(
                        MigrationEvent::new(migration.id, EventType::LockAcquired)
                            .with("resource", &handle.resource)
                            .with("fencing_token", handle.fencing_token),
                    )
                    .await;
                    tracing::info!(
                        migration_id = %migration.id,
                        resource = %handle.resource,
                        fencing_token = handle.fencing_token,
                        "Acquired migration lock"
                    );
                    return Ok(Some(handle));
                }
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if let Error::LockHeld { holder, .. } = &e {
                        self.metrics.lock_contention.inc();
                        self.emit(
                            MigrationEvent::new(migration.id, EventType::LockContended)
                                .with("holder", holder)
                                .with("attempt", attempt),
                        )
                        .await;
                    }
                    if attempt >= policy.max_retries {
                        return Err(e);
                    }
                    let delay = policy.delay_for(attempt - 1);
                    tracing::debug!(
                        migration_id = %migration.id,
                        %resource,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Lock unavailable, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn release_lock(&self, id: MigrationId, handle: &LockHandle) {
        match self.locks.release(handle).await {
            Ok(()) => {
                self.emit(MigrationEvent::new(id, EventType::LockReleased).with("resource", &handle.resource))
                    .await;
                tracing::debug!(migration_id = %id, resource = %handle.resource, "Released migration lock");
            }
            Err(e) => {
                self.emit(
                    MigrationEvent::new(id, EventType::LockReleaseFailed)
                        .with("resource", &handle.resource)
                        .with("error", &e),
                )
                .await;
                tracing::warn!(
                    migration_id = %id,
                    resource = %handle.resource,
                    error = %e,
                    "Failed to release migration lock, it will expire on its own"
                );
            }
        }
    }

    /// Everything that happens while the lock is held.
    async fn run_locked(self: &Arc<Self>, id: MigrationId, keeper: &LockKeeper, cancel: &AtomicBool) -> Result<Tenure> {
        // Re-read under the lock: a previous holder may have finished it.
        let mut migration = self.store.get(id).await?;
        if migration.status.is_terminal() {
            tracing::debug!(migration_id = %id, status = %migration.status, "Finished while waiting for lock");
            return Ok(Tenure::Done);
        }

        if migration.status == MigrationStatus::Locking {
            if cancel.load(Ordering::SeqCst) || migration.cancel_requested {
                self.finish(&migration, MigrationStatus::Cancelled, None).await?;
                return Ok(Tenure::Done);
            }
            let update = TransitionUpdate::new().started_at(self.clock.now_ms());
            migration = match self.advance(&migration, MigrationStatus::Running, update).await? {
                Some(m) => m,
                None => return Ok(Tenure::Done),
            };
            self.metrics.started.inc();
        }

        let endpoints = match self.shards.resolve(migration.database_type, &migration.database) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::warn!(
                    migration_id = %id,
                    database_type = %migration.database_type,
                    database = %migration.database,
                    error = %e,
                    "Shard resolution failed"
                );
                self.finish(&migration, MigrationStatus::Failed, Some(MigrationFailure::from_error(&e)))
                    .await?;
                return Ok(Tenure::Done);
            }
        };
        self.emit(
            MigrationEvent::new(id, EventType::ShardsResolved)
                .with("count", endpoints.len())
                .with("topology_version", self.shards.version()),
        )
        .await;

        let (migration, remaining) = self.prepare_shards(migration, endpoints).await?;
        match self.dispatch(&migration, remaining, keeper, cancel).await? {
            Some(Interrupt::LockLost) => Ok(Tenure::Lost),
            interrupt => {
                self.finalize(id, interrupt).await?;
                Ok(Tenure::Done)
            }
        }
    }

    /// Record pending progress for new shards and pick the ones still to run.
    async fn prepare_shards(
        &self,
        mut migration: Migration,
        endpoints: Vec<ShardEndpoint>,
    ) -> Result<(Migration, VecDeque<(ShardEndpoint, u32)>)> {
        let mut remaining = VecDeque::new();
        for endpoint in &endpoints {
            match migration.shard(&endpoint.shard_id) {
                Some(progress) if progress.status.is_terminal() => {
                    tracing::debug!(
                        migration_id = %migration.id,
                        shard_id = %endpoint.shard_id,
                        status = %progress.status,
                        "Shard already finished, not re-running"
                    );
                }
                Some(progress) => remaining.push_back((endpoint.clone(), progress.attempt_count)),
                None => {
                    let pending = ShardProgress::pending(endpoint.shard_id.clone(), self.clock.now_ms());
                    migration = self.store.record_shard_progress(migration.id, pending).await?;
                    remaining.push_back((endpoint.clone(), 0));
                }
            }
        }

        // Shards recorded by an earlier run that the topology no longer lists.
        let orphaned: Vec<ShardProgress> = migration
            .shards
            .iter()
            .filter(|s| !s.status.is_terminal() && !endpoints.iter().any(|e| e.shard_id == s.shard_id))
            .cloned()
            .collect();
        for mut progress in orphaned {
            tracing::warn!(
                migration_id = %migration.id,
                shard_id = %progress.shard_id,
                "Shard no longer in topology, marking failed"
            );
            progress.status = ShardStatus::Failed;
            progress.last_error = Some("shard no longer in topology".to_string());
            progress.updated_at = self.clock.now_ms();
            migration = self.store.record_shard_progress(migration.id, progress).await?;
        }

        Ok((migration, remaining))
    }

    /// Schedule shards under the shard slot limit, committing results as they land.
    async fn dispatch(
        self: &Arc<Self>,
        migration: &Migration,
        mut remaining: VecDeque<(ShardEndpoint, u32)>,
        keeper: &LockKeeper,
        cancel: &AtomicBool,
    ) -> Result<Option<Interrupt>> {
        let shared = Arc::new(migration.clone());
        let mut tasks: JoinSet<ShardOutcome> = JoinSet::new();
        let mut interrupt = None;

        while interrupt.is_none() && !remaining.is_empty() {
            interrupt = self.check_interrupt(migration, keeper, cancel).await?;
            if interrupt.is_some() {
                break;
            }

            tokio::select! {
                biased;
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    interrupt = self.commit_shard(migration.id, joined, keeper).await?;
                }
                slot = self.admission.acquire_shard_slot() => {
                    let slot = slot?;
                    // The wait may have been long.
                    interrupt = self.check_interrupt(migration, keeper, cancel).await?;
                    if interrupt.is_none() {
                        if let Some((endpoint, prior_attempts)) = remaining.pop_front() {
                            let inner = Arc::clone(self);
                            let migration = Arc::clone(&shared);
                            tasks.spawn(
                                async move { inner.run_shard(migration, endpoint, prior_attempts, slot).await }
                                    .in_current_span(),
                            );
                        }
                    }
                }
            }
        }

        // In-flight shards always complete; their results are committed
        // unless the lock is gone.
        while let Some(joined) = tasks.join_next().await {
            let lost = self.commit_shard(migration.id, joined, keeper).await?;
            if interrupt.is_none() {
                interrupt = lost;
            }
        }

        if let Some(reason) = interrupt {
            for (endpoint, _) in remaining {
                self.emit(
                    MigrationEvent::new(migration.id, EventType::ShardSkipped)
                        .shard(endpoint.shard_id)
                        .with("reason", reason.as_str()),
                )
                .await;
            }
        }
        Ok(interrupt)
    }

    /// Cooperative checkpoint between shard units.
    async fn check_interrupt(
        &self,
        migration: &Migration,
        keeper: &LockKeeper,
        cancel: &AtomicBool,
    ) -> Result<Option<Interrupt>> {
        if keeper.is_lost() {
            return Ok(Some(Interrupt::LockLost));
        }
        if cancel.load(Ordering::SeqCst) {
            return Ok(Some(Interrupt::Cancelled));
        }
        // Another worker may have persisted the request.
        if self.store.get(migration.id).await?.cancel_requested {
            cancel.store(true, Ordering::SeqCst);
            return Ok(Some(Interrupt::Cancelled));
        }
        if let (Some(timeout), Some(started_at)) = (self.config.migration_timeout, migration.started_at) {
            let elapsed = self.clock.now_ms().saturating_sub(started_at);
            if elapsed >= timeout.as_millis() as u64 {
                tracing::warn!(
                    migration_id = %migration.id,
                    elapsed_ms = elapsed,
                    timeout_ms = timeout.as_millis() as u64,
                    "Migration timed out"
                );
                return Ok(Some(Interrupt::TimedOut));
            }
        }
        Ok(None)
    }

    /// One shard with local retries. Holds its shard slot throughout.
    async fn run_shard(
        self: Arc<Self>,
        migration: Arc<Migration>,
        endpoint: ShardEndpoint,
        prior_attempts: u32,
        _slot: SlotGuard,
    ) -> ShardOutcome {
        let policy = &self.config.retry;
        let started = Instant::now();
        let _running = self.metrics.shards_running.track(migration.database_type);
        let mut attempt_count = prior_attempts;
        let mut last_error: Option<Error> = None;

        for attempt in 1..=policy.max_retries {
            attempt_count += 1;
            self.admission.throttle(migration.database_type).await;

            let running = ShardProgress {
                shard_id: endpoint.shard_id.clone(),
                status: ShardStatus::Running,
                attempt_count,
                last_error: last_error.as_ref().map(|e| e.to_string()),
                updated_at: self.clock.now_ms(),
            };
            if let Err(e) = self.store.record_shard_progress(migration.id, running).await {
                tracing::warn!(
                    migration_id = %migration.id,
                    shard_id = %endpoint.shard_id,
                    error = %e,
                    "Could not record shard start"
                );
            }
            self.emit(
                MigrationEvent::new(migration.id, EventType::ShardStarted)
                    .shard(endpoint.shard_id.clone())
                    .with("attempt", attempt_count),
            )
            .await;

            let attempt_started = Instant::now();
            let result = self.execute_shard(&migration, &endpoint, attempt_count).await;
            self.metrics
                .record_shard_attempt(migration.database_type, attempt_started.elapsed());

            let e = match result {
                Ok(()) => {
                    return ShardOutcome {
                        progress: ShardProgress {
                            shard_id: endpoint.shard_id.clone(),
                            status: ShardStatus::Succeeded,
                            attempt_count,
                            last_error: None,
                            updated_at: self.clock.now_ms(),
                        },
                        error: None,
                        duration: started.elapsed(),
                    };
                }
                Err(e) => e,
            };

            if matches!(e, Error::DatabaseConnection(_)) {
                self.connections
                    .evict(migration.database_type, &endpoint.connection_uri)
                    .await;
            }
            let retry = e.is_retryable() && attempt < policy.max_retries;
            if retry {
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    migration_id = %migration.id,
                    shard_id = %endpoint.shard_id,
                    attempt = attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Shard attempt failed, retrying"
                );
                self.emit(
                    MigrationEvent::new(migration.id, EventType::ShardRetrying)
                        .shard(endpoint.shard_id.clone())
                        .with("attempt", attempt_count)
                        .with("error", &e)
                        .with("delay_ms", delay.as_millis()),
                )
                .await;
                last_error = Some(e);
                tokio::time::sleep(delay).await;
            } else {
                last_error = Some(e);
                break;
            }
        }

        ShardOutcome {
            progress: ShardProgress {
                shard_id: endpoint.shard_id.clone(),
                status: ShardStatus::Failed,
                attempt_count,
                last_error: last_error.as_ref().map(|e| e.to_string()),
                updated_at: self.clock.now_ms(),
            },
            error: last_error,
            duration: started.elapsed(),
        }
    }

    async fn execute_shard(&self, migration: &Migration, endpoint: &ShardEndpoint, attempt: u32) -> Result<()> {
        let client = self
            .connections
            .client(migration.database_type, &endpoint.connection_uri)
            .await?;
        let task = ShardTask::new(migration, endpoint, attempt, self.config.default_batch_size, client);
        self.executor.execute(&task).await
    }

    /// Fence, then persist a shard result.
    ///
    /// Returns `Some(LockLost)` instead of committing when the lock is gone.
    async fn commit_shard(
        &self,
        id: MigrationId,
        joined: std::result::Result<ShardOutcome, JoinError>,
        keeper: &LockKeeper,
    ) -> Result<Option<Interrupt>> {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                // The shard stays RUNNING, which fails the aggregate.
                tracing::error!(migration_id = %id, error = %e, "Shard task panicked");
                return Ok(None);
            }
        };
        let shard_id = outcome.progress.shard_id.clone();

        if let Err(e) = self.validate_lock(keeper).await {
            tracing::error!(
                migration_id = %id,
                %shard_id,
                error = %e,
                "Lock no longer held, shard result not committed"
            );
            return Ok(Some(Interrupt::LockLost));
        }

        let progress = outcome.progress;
        let duration_ms = outcome.duration.as_millis() as u64;
        let attempts = progress.attempt_count;
        let status = progress.status;
        let migration = self.store.record_shard_progress(id, progress).await?;

        if status == ShardStatus::Failed {
            let e = outcome
                .error
                .unwrap_or_else(|| Error::Internal("shard failed without an error".into()));
            self.metrics.record_shard_failure(migration.database_type);
            self.emit(
                MigrationEvent::new(id, EventType::ShardFailed)
                    .shard(shard_id.clone())
                    .with("attempts", attempts)
                    .with("code", e.code())
                    .with("error", &e)
                    .with("duration_ms", duration_ms),
            )
            .await;
            tracing::error!(
                migration_id = %id,
                %shard_id,
                attempts,
                code = e.code(),
                error = %e,
                duration_ms,
                "Shard failed"
            );
        } else {
            self.emit(
                MigrationEvent::new(id, EventType::ShardSucceeded)
                    .shard(shard_id.clone())
                    .with("attempts", attempts)
                    .with("duration_ms", duration_ms),
            )
            .await;
            tracing::info!(migration_id = %id, %shard_id, attempts, duration_ms, "Shard succeeded");
        }
        Ok(None)
    }

    /// Fencing check, retrying transient store errors.
    async fn validate_lock(&self, keeper: &LockKeeper) -> Result<()> {
        let policy = &self.config.retry;
        let mut attempt = 0;
        loop {
            match keeper.validate().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < policy.max_retries => {
                    tracing::debug!(error = %e, attempt, "Lock validation failed, retrying");
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pick and persist the terminal status.
    async fn finalize(&self, id: MigrationId, interrupt: Option<Interrupt>) -> Result<()> {
        let migration = self.store.get(id).await?;
        let (to, failure) = match interrupt {
            Some(Interrupt::Cancelled) => (MigrationStatus::Cancelled, None),
            Some(Interrupt::TimedOut) => (MigrationStatus::Failed, Some(MigrationFailure::from_error(&Error::Timeout))),
            // Handled by the caller without touching the record.
            Some(Interrupt::LockLost) => return Ok(()),
            None => match migration.aggregate_shard_status() {
                Some(MigrationStatus::Succeeded) => (MigrationStatus::Succeeded, None),
                Some(status) => {
                    let failed: Vec<&str> = migration
                        .shards
                        .iter()
                        .filter(|s| s.status == ShardStatus::Failed)
                        .map(|s| s.shard_id.as_str())
                        .collect();
                    let message = format!(
                        "{} of {} shards failed: {}",
                        failed.len(),
                        migration.shards.len(),
                        failed.join(", ")
                    );
                    (status, Some(MigrationFailure::from_error(&Error::Migration(message))))
                }
                None => (
                    MigrationStatus::Failed,
                    Some(MigrationFailure::from_error(&Error::Internal(
                        "shard outcomes incomplete".into(),
                    ))),
                ),
            },
        };
        self.finish(&migration, to, failure).await?;
        Ok(())
    }
}
