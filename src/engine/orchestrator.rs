//! Migration orchestrator.
//!
//! The orchestrator is the only component that moves migrations through the
//! state machine:
//!
//! ```text
//!                 admission slot        lock acquired
//!   ┌─────────┐   granted        ┌─────────┐   + fenced     ┌─────────┐
//!   │ PENDING │ ───────────────► │ LOCKING │ ─────────────► │ RUNNING │
//!   └─────────┘                  └─────────┘                └─────────┘
//!        │                         │     │ lock retries          │
//!        │ cancel                  │     │ exhausted             │ shards done /
//!        ▼                         ▼     ▼                       ▼ cancel / timeout
//!   ┌───────────┐           ┌───────────┐ ┌────────┐   ┌───────────┬──────────────────┐
//!   │ CANCELLED │ ◄──────── │ CANCELLED │ │ FAILED │   │ SUCCEEDED │ FAILED │ PARTIALLY │
//!   └───────────┘           └───────────┘ └────────┘   │ CANCELLED │        │ _FAILED   │
//!                                                      └───────────┴──────────────────┘
//! ```
//!
//! It holds no authoritative state. The queue of admitted-but-waiting
//! migrations and the cancellation flags are local hints; every decision is
//! re-checked against the state store through compare-and-swap transitions,
//! so several orchestrators (in one process or many) can share one store.
//!
//! # Lifecycle
//!
//! 1. [`submit_migration`](MigrationOrchestrator::submit_migration) persists a
//!    PENDING record and queues it FIFO.
//! 2. Whenever an admission slot is free the head of the queue is spawned as
//!    an execution task (see `runner.rs`).
//! 3. The task releases its slot when the migration is terminal, which admits
//!    the next queued migration.
//!
//! [`recover`](MigrationOrchestrator::recover) re-queues persisted
//! non-terminal migrations after a restart.
//! [`shutdown`](MigrationOrchestrator::shutdown) stops admission, waits for
//! in-flight executions and closes the connection registry.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use super::executor::{NoOpShardExecutor, ShardExecutor};
use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::context::RequestContext;
use crate::coordination::{
    AdmissionController, EventLog, EventStore, EventType, InMemoryEventStore, InMemoryLockManager,
    InMemoryMigrationStore, LockManager, MigrationEvent, MigrationStateStore, TransitionUpdate,
};
use crate::error::{Error, Result};
use crate::metrics::CoordinatorMetrics;
use crate::topology::{ConnectionRegistry, ShardRegistry, ShardTopology};
use crate::types::{Migration, MigrationFilter, MigrationId, MigrationSpec, MigrationStatus};

/// Migration waiting for an admission slot.
#[derive(Debug)]
struct Queued {
    id: MigrationId,
    /// Span the execution task runs in, carrying the request correlation ids.
    span: Span,
}

/// Shared state behind the orchestrator handle and its execution tasks.
#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) config: CoordinatorConfig,
    pub(crate) store: Arc<dyn MigrationStateStore>,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) events: Arc<EventLog>,
    pub(crate) shards: Arc<ShardRegistry>,
    pub(crate) connections: Arc<ConnectionRegistry>,
    pub(crate) executor: Arc<dyn ShardExecutor>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: Arc<CoordinatorMetrics>,
    pub(crate) admission: AdmissionController,
    queue: Mutex<VecDeque<Queued>>,
    /// Cancellation flags of migrations queued or running on this worker.
    pub(crate) cancel_flags: DashMap<MigrationId, Arc<AtomicBool>>,
    /// Execution task handles. Also serializes spawning against shutdown.
    runs: Mutex<Vec<JoinHandle<()>>>,
    discovery: Mutex<Option<(mpsc::Sender<()>, JoinHandle<()>)>>,
    running: AtomicBool,
}

impl Inner {
    /// Queue a migration unless this worker already tracks it.
    fn enqueue(&self, id: MigrationId, span: Span) -> bool {
        if self.cancel_flags.contains_key(&id) {
            return false;
        }
        self.cancel_flags.insert(id, Arc::new(AtomicBool::new(false)));
        let mut queue = self.queue.lock();
        queue.push_back(Queued { id, span });
        self.metrics.queued.set(queue.len() as i64);
        true
    }

    fn dequeue(&self, id: MigrationId) {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|q| q.id != id);
        if queue.len() != before {
            self.cancel_flags.remove(&id);
        }
        self.metrics.queued.set(queue.len() as i64);
    }

    /// Admit queued migrations while slots are free.
    pub(crate) fn pump(self: &Arc<Self>) {
        loop {
            let mut runs = self.runs.lock();
            if !self.running.load(Ordering::Acquire) {
                return;
            }
            let Some(slot) = self.admission.try_admit() else {
                return;
            };
            let next = {
                let mut queue = self.queue.lock();
                let next = queue.pop_front();
                self.metrics.queued.set(queue.len() as i64);
                next
            };
            let Some(Queued { id, span }) = next else {
                return;
            };
            self.metrics.active.set(self.admission.running() as i64);
            tracing::debug!(
                migration_id = %id,
                running = self.admission.running(),
                "Admitted migration"
            );

            let inner = Arc::clone(self);
            let handle = tokio::spawn(
                async move {
                    inner.drive(id).await;
                    drop(slot);
                    inner.metrics.active.set(inner.admission.running() as i64);
                    inner.pump();
                }
                .instrument(span),
            );
            runs.retain(|h| !h.is_finished());
            runs.push(handle);
        }
    }

    pub(crate) async fn emit(&self, event: MigrationEvent) {
        self.events.append(event).await;
    }
}

/// Builder for [`MigrationOrchestrator`].
///
/// Only the connection registry is mandatory. Everything else defaults to
/// the in-memory implementation, which is fine for a single worker.
#[derive(Debug)]
pub struct OrchestratorBuilder {
    config: CoordinatorConfig,
    store: Option<Arc<dyn MigrationStateStore>>,
    locks: Option<Arc<dyn LockManager>>,
    event_store: Option<Arc<dyn EventStore>>,
    shards: Option<Arc<ShardRegistry>>,
    connections: Option<Arc<ConnectionRegistry>>,
    executor: Option<Arc<dyn ShardExecutor>>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<CoordinatorMetrics>>,
}

impl OrchestratorBuilder {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            store: None,
            locks: None,
            event_store: None,
            shards: None,
            connections: None,
            executor: None,
            clock: None,
            metrics: None,
        }
    }

    pub fn state_store(mut self, store: Arc<dyn MigrationStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn event_store(mut self, events: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(events);
        self
    }

    pub fn shard_registry(mut self, shards: Arc<ShardRegistry>) -> Self {
        self.shards = Some(shards);
        self
    }

    pub fn connections(mut self, connections: Arc<ConnectionRegistry>) -> Self {
        self.connections = Some(connections);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn ShardExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metrics(mut self, metrics: Arc<CoordinatorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and assemble the orchestrator.
    ///
    /// Starts the shard discovery loop when enabled, so it must be called
    /// from within a Tokio runtime.
    pub fn build(self) -> Result<MigrationOrchestrator> {
        self.config.validate()?;
        let connections = self
            .connections
            .ok_or_else(|| Error::Config("a connection registry is required".into()))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryMigrationStore::new(clock.clone())));
        let locks = self
            .locks
            .unwrap_or_else(|| Arc::new(InMemoryLockManager::new(clock.clone())));
        let event_store = self
            .event_store
            .unwrap_or_else(|| Arc::new(InMemoryEventStore::new()));
        let shards = self.shards.unwrap_or_else(|| {
            Arc::new(ShardRegistry::with_topology(ShardTopology::from_database_config(
                &self.config.database,
            )))
        });

        let discovery = if self.config.shards.discovery_enabled {
            tracing::info!(
                interval_secs = self.config.shards.discovery_interval.as_secs(),
                "Starting shard discovery"
            );
            Some(shards.spawn_discovery(self.config.shards.discovery_interval))
        } else {
            None
        };

        let inner = Inner {
            admission: AdmissionController::from_config(&self.config),
            events: Arc::new(EventLog::new(event_store, clock.clone())),
            executor: self.executor.unwrap_or_else(|| Arc::new(NoOpShardExecutor)),
            metrics: self.metrics.unwrap_or_default(),
            config: self.config,
            store,
            locks,
            shards,
            connections,
            clock,
            queue: Mutex::new(VecDeque::new()),
            cancel_flags: DashMap::new(),
            runs: Mutex::new(Vec::new()),
            discovery: Mutex::new(discovery),
            running: AtomicBool::new(true),
        };
        tracing::info!(
            worker_id = %inner.config.worker_id,
            max_parallel_migrations = inner.config.max_parallel_migrations,
            max_parallel_shards = inner.config.max_parallel_shards,
            throttled = inner.admission.is_throttled(),
            "Migration orchestrator ready"
        );
        Ok(MigrationOrchestrator { inner: Arc::new(inner) })
    }
}

/// Snapshot of orchestrator liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub running: bool,
    pub worker_id: String,
    /// Migrations holding an admission slot on this worker.
    pub active_migrations: usize,
    /// Migrations waiting for a slot on this worker.
    pub queued_migrations: usize,
    pub shards_in_flight: usize,
    pub registry_version: u64,
    pub open_connections: usize,
    /// Audit events waiting for the event store to recover.
    pub pending_events: usize,
}

/// Drives migrations from submission to a terminal status.
#[derive(Debug, Clone)]
pub struct MigrationOrchestrator {
    inner: Arc<Inner>,
}

impl MigrationOrchestrator {
    pub fn builder(config: CoordinatorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Submit a migration for execution.
    ///
    /// Resubmitting a name + version that is still in flight returns the
    /// existing id. Resubmitting one that already finished fails with
    /// [`Error::MigrationAlreadyExists`] unless `spec.retry_of` names the
    /// latest attempt, in which case a new attempt is created.
    pub async fn submit_migration(&self, spec: MigrationSpec, ctx: &RequestContext) -> Result<MigrationId> {
        let span = ctx.span("submit_migration");
        self.submit_inner(spec, ctx)
            .instrument(span.clone())
            .await
            .inspect_err(|e| {
                span.in_scope(|| tracing::warn!(code = e.code(), error = %e, "Migration submission rejected"));
            })
    }

    async fn submit_inner(&self, spec: MigrationSpec, ctx: &RequestContext) -> Result<MigrationId> {
        let inner = &self.inner;
        if !inner.running.load(Ordering::Acquire) {
            return Err(Error::Internal("orchestrator is shut down".into()));
        }
        spec.validate()?;

        let attempt = match inner.store.find_latest(&spec.name, &spec.version).await? {
            None => {
                if let Some(prior) = spec.retry_of {
                    return Err(Error::MigrationNotFound(prior));
                }
                1
            }
            Some(existing) if !existing.status.is_terminal() => {
                if spec.retry_of.is_some() {
                    return Err(Error::MigrationInProgress(existing.id));
                }
                tracing::info!(
                    migration_id = %existing.id,
                    status = %existing.status,
                    "Migration already in flight, returning existing id"
                );
                return Ok(existing.id);
            }
            Some(existing) => match spec.retry_of {
                Some(prior) if prior == existing.id => existing.attempt + 1,
                Some(prior) => {
                    return Err(Error::Validation(format!(
                        "retry_of {} is not the latest attempt ({}) of {} v{}",
                        prior, existing.id, spec.name, spec.version
                    )));
                }
                None => {
                    return Err(Error::MigrationAlreadyExists {
                        name: spec.name,
                        version: spec.version,
                    });
                }
            },
        };

        let migration = Migration::from_spec(&spec, attempt, inner.clock.now_ms());
        if let Err(e) = inner.store.create(&migration).await {
            // A concurrent submission of the same attempt won the insert.
            if let Error::MigrationAlreadyExists { .. } = e {
                if let Some(winner) = inner.store.find_latest(&spec.name, &spec.version).await? {
                    if !winner.status.is_terminal() && spec.retry_of.is_none() {
                        return Ok(winner.id);
                    }
                }
            }
            return Err(e);
        }

        let id = migration.id;
        inner.metrics.submitted.inc();
        inner
            .emit(
                MigrationEvent::new(id, EventType::Submitted)
                    .with("name", &migration.name)
                    .with("version", &migration.version)
                    .with("attempt", migration.attempt)
                    .with("database_type", migration.database_type)
                    .with("database", &migration.database)
                    .with("request_id", &ctx.request_id)
                    .with("correlation_id", &ctx.correlation_id),
            )
            .await;
        tracing::info!(
            migration_id = %id,
            name = %migration.name,
            version = %migration.version,
            attempt = migration.attempt,
            database_type = %migration.database_type,
            database = %migration.database,
            "Migration submitted"
        );

        let run_span = tracing::info_span!("migration", migration_id = %id);
        inner.enqueue(id, run_span);
        inner.pump();
        Ok(id)
    }

    /// Current persisted record.
    pub async fn get_status(&self, id: MigrationId) -> Result<Migration> {
        self.inner.store.get(id).await
    }

    /// Request cancellation.
    ///
    /// PENDING and LOCKING migrations are cancelled immediately. RUNNING ones
    /// get a persisted flag observed between shard executions: in-flight
    /// shards complete, the rest are skipped. Terminal migrations are
    /// rejected with [`Error::InvalidTransition`].
    pub async fn cancel_migration(&self, id: MigrationId, ctx: &RequestContext) -> Result<Migration> {
        self.cancel_inner(id).instrument(ctx.span("cancel_migration")).await
    }

    async fn cancel_inner(&self, id: MigrationId) -> Result<Migration> {
        let inner = &self.inner;
        if let Some(flag) = inner.cancel_flags.get(&id) {
            flag.store(true, Ordering::SeqCst);
        }

        loop {
            let current = inner.store.get(id).await?;
            match current.status {
                status if status.is_terminal() => {
                    return Err(Error::InvalidTransition {
                        id,
                        from: status,
                        to: MigrationStatus::Cancelled,
                    });
                }
                MigrationStatus::Pending | MigrationStatus::Locking => {
                    match inner
                        .store
                        .transition(id, &[current.status], MigrationStatus::Cancelled, TransitionUpdate::new())
                        .await
                    {
                        Ok(cancelled) => {
                            inner.dequeue(id);
                            inner.emit(MigrationEvent::new(id, EventType::CancelRequested)).await;
                            inner
                                .emit(MigrationEvent::status_changed(id, current.status, MigrationStatus::Cancelled))
                                .await;
                            inner.metrics.record_terminal(MigrationStatus::Cancelled, None);
                            tracing::info!(migration_id = %id, from = %current.status, "Migration cancelled");
                            return Ok(cancelled);
                        }
                        // Moved on underneath us; look again.
                        Err(Error::InvalidTransition { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                _ => {
                    let flagged = inner.store.request_cancellation(id).await?;
                    inner.emit(MigrationEvent::new(id, EventType::CancelRequested)).await;
                    tracing::info!(migration_id = %id, "Cancellation requested for running migration");
                    return Ok(flagged);
                }
            }
        }
    }

    /// Persisted records matching a filter, oldest first.
    pub async fn list_migrations(&self, filter: &MigrationFilter) -> Result<Vec<Migration>> {
        self.inner.store.list(filter).await
    }

    /// Audit trail of a migration in timestamp order.
    pub async fn events(&self, id: MigrationId) -> Result<Vec<MigrationEvent>> {
        self.inner.store.get(id).await?;
        self.inner.events.query(id).await
    }

    /// Re-drive every persisted non-terminal migration.
    ///
    /// PENDING and LOCKING migrations are queued again. RUNNING ones
    /// re-acquire their lock and execute only shards without a terminal
    /// result. Returns the ids that were queued.
    pub async fn recover(&self, ctx: &RequestContext) -> Result<Vec<MigrationId>> {
        let span = ctx.span("recover");
        async {
            let inner = &self.inner;
            let candidates = inner.store.list(&MigrationFilter::non_terminal()).await?;
            let mut queued = Vec::new();
            for migration in candidates {
                let run_span = tracing::info_span!("migration", migration_id = %migration.id);
                if !inner.enqueue(migration.id, run_span) {
                    continue;
                }
                inner
                    .emit(MigrationEvent::new(migration.id, EventType::Recovered).with("status", migration.status))
                    .await;
                tracing::info!(
                    migration_id = %migration.id,
                    status = %migration.status,
                    shards_done = migration.shards.iter().filter(|s| s.status.is_terminal()).count(),
                    "Recovered migration"
                );
                queued.push(migration.id);
            }
            tracing::info!(count = queued.len(), "Recovery queued migrations");
            inner.pump();
            Ok(queued)
        }
        .instrument(span)
        .await
    }

    pub fn health(&self) -> HealthStatus {
        let inner = &self.inner;
        HealthStatus {
            running: inner.running.load(Ordering::Acquire),
            worker_id: inner.config.worker_id.clone(),
            active_migrations: inner.admission.running(),
            queued_migrations: inner.queue.lock().len(),
            shards_in_flight: inner.admission.shards_in_flight(),
            registry_version: inner.shards.version(),
            open_connections: inner.connections.len(),
            pending_events: inner.events.pending_len(),
        }
    }

    pub fn metrics(&self) -> &CoordinatorMetrics {
        &self.inner.metrics
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn shard_registry(&self) -> &Arc<ShardRegistry> {
        &self.inner.shards
    }

    /// Stop admitting, wait for in-flight executions, close connections.
    ///
    /// Queued migrations stay PENDING in the store and are picked up by
    /// [`recover`](Self::recover) on the next start. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        {
            let _runs = inner.runs.lock();
            if !inner.running.swap(false, Ordering::AcqRel) {
                return;
            }
        }
        tracing::info!(worker_id = %inner.config.worker_id, "Shutting down migration orchestrator");

        let left_queued = {
            let mut queue = inner.queue.lock();
            let left = queue.len();
            for queued in queue.drain(..) {
                inner.cancel_flags.remove(&queued.id);
            }
            inner.metrics.queued.set(0);
            left
        };

        let discovery = inner.discovery.lock().take();
        if let Some((shutdown_tx, handle)) = discovery {
            let _ = shutdown_tx.send(()).await;
            let _ = handle.await;
        }

        let runs = std::mem::take(&mut *inner.runs.lock());
        let in_flight = runs.len();
        for handle in runs {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Migration task panicked");
            }
        }

        let parked = inner.events.flush().await;
        if parked > 0 {
            tracing::warn!(parked, "Audit events still parked at shutdown");
        }
        inner.connections.close_all().await;
        tracing::info!(in_flight, left_queued, "Migration orchestrator stopped");
    }
}
