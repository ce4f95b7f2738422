//! End-to-end orchestrator scenarios over in-memory stores.
//!
//! Every scenario drives the public orchestrator API with a
//! [`ScriptedExecutor`](super::ScriptedExecutor) and observes the outcome
//! through persisted records, the audit trail and the lock manager.

#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use super::{
    mongo_topology, test_config, wait_for_result, wait_for_status, wait_for_terminal, ScriptedExecutor, TestHarness,
};
use crate::clock::Clock;
use crate::config::{CoordinatorConfig, RetryPolicy};
use crate::context::RequestContext;
use crate::coordination::{EventType, LockManager, MigrationEvent, MigrationStateStore, TransitionUpdate};
use crate::error::Error;
use crate::telemetry::init_test_tracing;
use crate::topology::{ShardEntry, ShardTopology};
use crate::types::{
    lock_resource_for, DatabaseType, Migration, MigrationFilter, MigrationId, MigrationSpec, MigrationStatus,
    ShardProgress, ShardStatus,
};

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Helpers
// ============================================================================

fn harness(config: CoordinatorConfig, topology: ShardTopology) -> TestHarness {
    init_test_tracing();
    TestHarness::new(config, topology).unwrap()
}

async fn terminal(h: &TestHarness, id: MigrationId) -> Migration {
    wait_for_terminal(&h.orchestrator, id, WAIT)
        .await
        .expect("migration did not reach a terminal status")
}

/// Wait until the audit trail satisfies `predicate`.
async fn events_until<P>(h: &TestHarness, id: MigrationId, predicate: P) -> Vec<MigrationEvent>
where
    P: Fn(&[MigrationEvent]) -> bool,
{
    wait_for_result(
        || h.orchestrator.events(id),
        |r| r.as_ref().map(|e| predicate(e)).unwrap_or(false),
        WAIT,
    )
    .await
    .expect("expected events never appeared")
    .unwrap()
}

/// Audit trail once the run gave its lock back (successfully or not).
async fn settled(h: &TestHarness, id: MigrationId) -> Vec<MigrationEvent> {
    events_until(h, id, |events| {
        events
            .iter()
            .any(|e| matches!(e.event_type, EventType::LockReleased | EventType::LockReleaseFailed))
    })
    .await
}

fn count(events: &[MigrationEvent], event_type: EventType) -> usize {
    events.iter().filter(|e| e.event_type == event_type).count()
}

fn shard<'a>(m: &'a Migration, shard_id: &str) -> &'a ShardProgress {
    m.shard(shard_id).unwrap_or_else(|| panic!("no progress for {}", shard_id))
}

async fn idle(h: &TestHarness) {
    wait_for_result(
        || async { h.orchestrator.health() },
        |health| health.active_migrations == 0 && health.queued_migrations == 0,
        WAIT,
    )
    .await
    .expect("orchestrator never went idle");
}

/// Persist a migration directly, as a crashed worker would have left it.
async fn persist(h: &TestHarness, name: &str, database: &str, to: &[MigrationStatus]) -> Migration {
    let spec = MigrationSpec::new(name, "1", DatabaseType::MongoDb, database);
    let mut migration = Migration::from_spec(&spec, 1, h.clock.now_ms());
    h.store.create(&migration).await.unwrap();
    for &status in to {
        let mut update = TransitionUpdate::new();
        if status == MigrationStatus::Running {
            update = update.started_at(h.clock.now_ms());
        }
        migration = h
            .store
            .transition(migration.id, &[migration.status], status, update)
            .await
            .unwrap();
    }
    migration
}

// ============================================================================
// 1. Lifecycle
// ============================================================================

#[tokio::test]
async fn test_all_shards_succeed() {
    let h = harness(test_config(), mongo_topology("orders", "ord-", 3));
    let id = h.submit("add_index", "orders").await.unwrap();

    let done = terminal(&h, id).await;
    assert_eq!(done.status, MigrationStatus::Succeeded);
    assert!(done.error.is_none());
    assert!(done.started_at.is_some());
    assert!(done.completed_at >= done.started_at);
    assert_eq!(done.shards.len(), 3);
    for progress in &done.shards {
        assert_eq!(progress.status, ShardStatus::Succeeded);
        assert_eq!(progress.attempt_count, 1);
    }

    let events = settled(&h, id).await;
    // PENDING -> LOCKING -> RUNNING -> SUCCEEDED
    assert_eq!(count(&events, EventType::StatusChanged), 3);
    assert_eq!(count(&events, EventType::ShardSucceeded), 3);
    assert_eq!(events[0].event_type, EventType::Submitted);
    assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    assert!(h.locks.current(&done.lock_resource()).await.unwrap().is_none());
    let metrics = h.orchestrator.metrics().snapshot();
    assert_eq!(metrics.submitted, 1);
    assert_eq!(metrics.started, 1);
    assert_eq!(metrics.succeeded, 1);
    assert_eq!(metrics.shard_attempts, 3);
}

#[tokio::test]
async fn test_one_shard_exhausting_retries_partially_fails() {
    let h = harness(test_config(), mongo_topology("orders", "ord-", 3));
    h.executor
        .fail_always("ord-1", Error::DatabaseQuery("duplicate key".into()));

    let id = h.submit("backfill", "orders").await.unwrap();
    let done = terminal(&h, id).await;

    assert_eq!(done.status, MigrationStatus::PartiallyFailed);
    assert_eq!(done.count_shards(ShardStatus::Failed), 1);
    assert_eq!(done.count_shards(ShardStatus::Succeeded), 2);
    let failed = shard(&done, "ord-1");
    assert_eq!(failed.attempt_count, 3);
    assert!(failed.last_error.as_deref().unwrap_or_default().contains("duplicate key"));
    let error = done.error.expect("failure recorded");
    assert_eq!(error.code, "MIGRATION_ERROR");
    assert!(error.message.contains("ord-1"));

    assert_eq!(h.executor.attempts("ord-1"), 3);
    let events = settled(&h, id).await;
    assert_eq!(count(&events, EventType::ShardRetrying), 2);
    assert_eq!(count(&events, EventType::ShardFailed), 1);
    assert_eq!(h.orchestrator.metrics().snapshot().partially_failed, 1);
}

#[tokio::test]
async fn test_non_retryable_error_fails_shard_immediately() {
    let h = harness(test_config(), mongo_topology("orders", "ord-", 1));
    h.executor.fail_always("ord-0", Error::Validation("bad column".into()));

    let id = h.submit("rename_column", "orders").await.unwrap();
    let done = terminal(&h, id).await;

    assert_eq!(done.status, MigrationStatus::Failed);
    assert_eq!(shard(&done, "ord-0").attempt_count, 1);
    assert_eq!(h.executor.attempts("ord-0"), 1);
    assert_eq!(done.error.as_ref().map(|e| e.code.as_str()), Some("MIGRATION_ERROR"));
}

#[tokio::test]
async fn test_transient_failure_recovers_within_retries() {
    let h = harness(test_config(), mongo_topology("orders", "ord-", 2));
    h.executor
        .fail_times("ord-0", 2, Error::ExternalServiceTimeout("search".into()));

    let id = h.submit("reindex", "orders").await.unwrap();
    let done = terminal(&h, id).await;

    assert_eq!(done.status, MigrationStatus::Succeeded);
    assert_eq!(shard(&done, "ord-0").attempt_count, 3);
    assert_eq!(shard(&done, "ord-1").attempt_count, 1);
}

#[tokio::test]
async fn test_refused_shard_connection_is_retried_then_failed() {
    let h = harness(test_config(), mongo_topology("orders", "ord-", 2));
    h.factory.refuse("mongodb://ord-1:27017");

    let id = h.submit("add_index", "orders").await.unwrap();
    let done = terminal(&h, id).await;

    assert_eq!(done.status, MigrationStatus::PartiallyFailed);
    let failed = shard(&done, "ord-1");
    assert_eq!(failed.status, ShardStatus::Failed);
    assert_eq!(failed.attempt_count, 3);
    assert!(failed.last_error.as_deref().unwrap_or_default().contains("connection refused"));
    // The executor never sees a shard it cannot connect to.
    assert_eq!(h.executor.attempts("ord-1"), 0);
}

#[tokio::test]
async fn test_unknown_database_fails_with_shard_not_found() {
    let h = harness(test_config(), ShardTopology::new());

    let id = h.submit("add_index", "ghost").await.unwrap();
    let done = terminal(&h, id).await;

    assert_eq!(done.status, MigrationStatus::Failed);
    assert_eq!(done.error.as_ref().map(|e| e.code.as_str()), Some("SHARD_NOT_FOUND"));
    assert!(done.shards.is_empty());
    assert!(h.executor.calls().is_empty());
    settled(&h, id).await;
}

#[tokio::test]
async fn test_throttled_migration_completes() {
    let config = test_config().with_throttle(1000);
    let h = harness(config, mongo_topology("orders", "ord-", 3));

    let id = h.submit("add_index", "orders").await.unwrap();
    assert_eq!(terminal(&h, id).await.status, MigrationStatus::Succeeded);
}

#[tokio::test]
async fn test_event_store_outage_does_not_fail_migration() {
    let h = harness(test_config(), mongo_topology("orders", "ord-", 2));
    h.events.fail_next_appends(4);

    let id = h.submit("add_index", "orders").await.unwrap();
    assert_eq!(terminal(&h, id).await.status, MigrationStatus::Succeeded);
}

// ============================================================================
// 2. Admission
// ============================================================================

#[tokio::test]
async fn test_admission_limits_running_migrations() {
    let topology = ["a", "b", "c"].iter().fold(ShardTopology::new(), |t, db| {
        t.with_shard(ShardEntry::new(
            format!("{}0", db),
            DatabaseType::MongoDb,
            *db,
            format!("mongodb://{}0:27017", db),
        ))
    });
    let config = test_config().with_max_parallel_migrations(2);
    let h = harness(config, topology);
    let gates: Vec<_> = ["a0", "b0", "c0"].iter().map(|s| h.executor.gate(*s)).collect();

    let a = h.submit("mig_a", "a").await.unwrap();
    let b = h.submit("mig_b", "b").await.unwrap();
    let c = h.submit("mig_c", "c").await.unwrap();

    gates[0].wait_entered().await;
    gates[1].wait_entered().await;
    assert_eq!(h.orchestrator.get_status(a).await.unwrap().status, MigrationStatus::Running);
    assert_eq!(h.orchestrator.get_status(b).await.unwrap().status, MigrationStatus::Running);
    assert_eq!(h.orchestrator.get_status(c).await.unwrap().status, MigrationStatus::Pending);
    let health = h.orchestrator.health();
    assert_eq!(health.active_migrations, 2);
    assert_eq!(health.queued_migrations, 1);
    assert_eq!(h.orchestrator.metrics().snapshot().queued, 1);

    // Freeing one slot admits the queued migration.
    gates[0].open();
    assert_eq!(terminal(&h, a).await.status, MigrationStatus::Succeeded);
    gates[2].wait_entered().await;
    assert_eq!(h.orchestrator.get_status(c).await.unwrap().status, MigrationStatus::Running);

    gates[1].open();
    gates[2].open();
    assert_eq!(terminal(&h, b).await.status, MigrationStatus::Succeeded);
    assert_eq!(terminal(&h, c).await.status, MigrationStatus::Succeeded);
    idle(&h).await;
}

#[tokio::test]
async fn test_shard_parallelism_is_bounded() {
    let config = test_config().with_max_parallel_shards(2);
    let h = harness(config, mongo_topology("orders", "ord-", 4));
    let gates: Vec<_> = (0..4).map(|i| h.executor.gate(format!("ord-{}", i))).collect();

    let id = h.submit("add_index", "orders").await.unwrap();
    gates[0].wait_entered().await;
    gates[1].wait_entered().await;
    assert_eq!(h.orchestrator.health().shards_in_flight, 2);
    assert_eq!(h.orchestrator.metrics().shards_running.get(DatabaseType::MongoDb), 2);
    assert_eq!(h.executor.calls().len(), 2);

    for gate in &gates {
        gate.open();
    }
    assert_eq!(terminal(&h, id).await.status, MigrationStatus::Succeeded);
    assert_eq!(h.orchestrator.metrics().snapshot().shards_running, 0);
}

// ============================================================================
// 3. Idempotency and retries
// ============================================================================

#[tokio::test]
async fn test_submission_idempotency_and_retry_attempts() {
    let h = harness(test_config(), mongo_topology("orders", "ord-", 1));
    let gate = h.executor.gate("ord-0");

    let first = h.submit("add_index", "orders").await.unwrap();
    let again = h.submit("add_index", "orders").await.unwrap();
    assert_eq!(first, again);

    gate.open();
    assert_eq!(terminal(&h, first).await.status, MigrationStatus::Succeeded);

    let err = h.submit("add_index", "orders").await.unwrap_err();
    assert!(matches!(err, Error::MigrationAlreadyExists { .. }));

    let ctx = RequestContext::new();
    let retry_spec = MigrationSpec::new("add_index", "1", DatabaseType::MongoDb, "orders").retry_of(first);
    let second = h.orchestrator.submit_migration(retry_spec.clone(), &ctx).await.unwrap();
    assert_ne!(first, second);
    let done = terminal(&h, second).await;
    assert_eq!(done.attempt, 2);
    assert_eq!(done.retry_of, Some(first));
    assert_eq!(done.status, MigrationStatus::Succeeded);

    // Only the latest attempt can be retried.
    let err = h.orchestrator.submit_migration(retry_spec, &ctx).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let unknown = MigrationSpec::new("never_ran", "1", DatabaseType::MongoDb, "orders").retry_of(MigrationId::new());
    let err = h.orchestrator.submit_migration(unknown, &ctx).await.unwrap_err();
    assert!(matches!(err, Error::MigrationNotFound(_)));

    let all = h.orchestrator.list_migrations(&MigrationFilter::all()).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_invalid_spec_is_rejected() {
    let h = harness(test_config(), mongo_topology("orders", "ord-", 1));
    let err = h.submit("", "orders").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(h.orchestrator.list_migrations(&MigrationFilter::all()).await.unwrap().is_empty());
}

// ============================================================================
// 4. Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_between_shards_skips_the_rest() {
    let config = test_config().with_max_parallel_shards(1);
    let h = harness(config, mongo_topology("orders", "ord-", 2));
    let gate = h.executor.gate("ord-0");

    let id = h.submit("backfill", "orders").await.unwrap();
    gate.wait_entered().await;

    let flagged = h.orchestrator.cancel_migration(id, &RequestContext::new()).await.unwrap();
    assert_eq!(flagged.status, MigrationStatus::Running);
    assert!(flagged.cancel_requested);
    gate.open();

    let done = terminal(&h, id).await;
    assert_eq!(done.status, MigrationStatus::Cancelled);
    assert_eq!(shard(&done, "ord-0").status, ShardStatus::Succeeded);
    let skipped = shard(&done, "ord-1");
    assert_eq!(skipped.status, ShardStatus::Pending);
    assert_eq!(skipped.attempt_count, 0);
    assert_eq!(h.executor.attempts("ord-1"), 0);

    let events = settled(&h, id).await;
    assert_eq!(count(&events, EventType::ShardSkipped), 1);
    assert_eq!(count(&events, EventType::CancelRequested), 1);
    assert_eq!(h.orchestrator.metrics().snapshot().cancelled, 1);
}

#[tokio::test]
async fn test_cancel_queued_migration() {
    let topology = mongo_topology("a", "a", 1).with_shard(ShardEntry::new(
        "b0",
        DatabaseType::MongoDb,
        "b",
        "mongodb://b0:27017",
    ));
    let h = harness(test_config().with_max_parallel_migrations(1), topology);
    let gate = h.executor.gate("a0");

    let running = h.submit("first", "a").await.unwrap();
    let queued = h.submit("second", "b").await.unwrap();
    gate.wait_entered().await;

    let cancelled = h.orchestrator.cancel_migration(queued, &RequestContext::new()).await.unwrap();
    assert_eq!(cancelled.status, MigrationStatus::Cancelled);
    assert_eq!(h.orchestrator.health().queued_migrations, 0);

    // Cancelling twice is a terminal-state violation.
    let err = h.orchestrator.cancel_migration(queued, &RequestContext::new()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    gate.open();
    assert_eq!(terminal(&h, running).await.status, MigrationStatus::Succeeded);
    idle(&h).await;
    assert_eq!(h.executor.attempts("b0"), 0);
    assert_eq!(h.orchestrator.get_status(queued).await.unwrap().status, MigrationStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_unknown_migration() {
    let h = harness(test_config(), ShardTopology::new());
    let err = h
        .orchestrator
        .cancel_migration(MigrationId::new(), &RequestContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MigrationNotFound(_)));
}

// ============================================================================
// 5. Locks, timeouts
// ============================================================================

#[tokio::test]
async fn test_held_lock_exhausts_retries() {
    let h = harness(test_config(), mongo_topology("orders", "ord-", 1));
    h.locks
        .acquire(&lock_resource_for("add_index"), "worker-b", Duration::from_secs(600))
        .await
        .unwrap();

    let id = h.submit("add_index", "orders").await.unwrap();
    let done = terminal(&h, id).await;

    assert_eq!(done.status, MigrationStatus::Failed);
    let error = done.error.expect("failure recorded");
    assert_eq!(error.code, "LOCK_TIMEOUT");
    assert!(error.message.contains("worker-b"));
    assert!(h.executor.calls().is_empty());

    let events = events_until(&h, id, |e| count(e, EventType::StatusChanged) == 2).await;
    assert_eq!(count(&events, EventType::LockContended), 3);
    assert_eq!(h.orchestrator.metrics().snapshot().lock_contention, 3);
    // Still the other worker's.
    let holder = h.locks.current(&lock_resource_for("add_index")).await.unwrap().unwrap();
    assert_eq!(holder.holder_id, "worker-b");
}

#[tokio::test]
async fn test_lapsed_lock_is_taken_back_and_run_resumes() {
    let config = test_config().with_max_parallel_shards(1);
    let h = harness(config, mongo_topology("orders", "ord-", 2));
    let gate = h.executor.gate("ord-0");

    let id = h.submit("backfill", "orders").await.unwrap();
    gate.wait_entered().await;

    // The lock lapses but nobody else claims it.
    h.clock.advance(Duration::from_secs(120));
    gate.open();

    let done = terminal(&h, id).await;
    assert_eq!(done.status, MigrationStatus::Succeeded);
    assert!(done.error.is_none());
    // The result fenced off by the lapse was run again under the new grant.
    assert_eq!(h.executor.attempts("ord-0"), 2);
    assert_eq!(shard(&done, "ord-0").attempt_count, 2);
    assert_eq!(h.executor.attempts("ord-1"), 1);

    let events = settled(&h, id).await;
    assert_eq!(count(&events, EventType::LockLost), 1);
    assert_eq!(count(&events, EventType::LockAcquired), 2);
    assert_eq!(count(&events, EventType::LockReleaseFailed), 0);
    assert!(h.locks.current(&lock_resource_for("backfill")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_stale_holder_leaves_migration_to_new_holder() {
    let config = test_config().with_max_parallel_shards(1);
    let h = harness(config, mongo_topology("orders", "ord-", 2));
    let stale_gate = h.executor.gate("ord-0");

    let id = h.submit("backfill", "orders").await.unwrap();
    stale_gate.wait_entered().await;

    // Worker A stalls past its TTL and worker B recovers the migration.
    h.clock.advance(Duration::from_secs(120));
    let peer_executor = Arc::new(ScriptedExecutor::new());
    let peer_gate = peer_executor.gate("ord-0");
    let peer = h
        .worker(
            test_config().with_worker_id("worker-b").with_max_parallel_shards(1),
            peer_executor.clone(),
        )
        .unwrap();
    assert_eq!(peer.recover(&RequestContext::new()).await.unwrap(), vec![id]);
    peer_gate.wait_entered().await;
    let resource = lock_resource_for("backfill");
    assert_eq!(
        h.locks.current(&resource).await.unwrap().map(|l| l.holder_id),
        Some("worker-b".to_string())
    );

    // A finishes its stale shard, sees the lock is gone and backs off.
    stale_gate.open();
    idle(&h).await;
    let midway = h.orchestrator.get_status(id).await.unwrap();
    assert_eq!(midway.status, MigrationStatus::Running);
    assert!(midway.error.is_none());
    assert_ne!(shard(&midway, "ord-0").status, ShardStatus::Succeeded);

    peer_gate.open();
    let done = terminal(&h, id).await;
    assert_eq!(done.status, MigrationStatus::Succeeded);
    assert_eq!(shard(&done, "ord-0").status, ShardStatus::Succeeded);
    assert_eq!(shard(&done, "ord-1").status, ShardStatus::Succeeded);
    assert_eq!(h.executor.attempts("ord-1"), 0);
    assert_eq!(peer_executor.attempts("ord-1"), 1);

    let events = settled(&h, id).await;
    assert_eq!(count(&events, EventType::LockLost), 1);
    assert_eq!(count(&events, EventType::LockReleaseFailed), 0);
    assert!(events
        .iter()
        .filter(|e| e.is_terminal_transition())
        .all(|e| e.get("to") == Some("SUCCEEDED")));
}

#[tokio::test]
async fn test_lock_lost_too_often_fails_with_lock_expired() {
    let config = test_config()
        .with_max_parallel_shards(1)
        .with_retry_policy(RetryPolicy::immediate(1));
    let h = harness(config, mongo_topology("orders", "ord-", 2));
    let gate = h.executor.gate("ord-0");

    let id = h.submit("backfill", "orders").await.unwrap();
    gate.wait_entered().await;
    h.clock.advance(Duration::from_secs(120));
    gate.open();

    let done = terminal(&h, id).await;
    assert_eq!(done.status, MigrationStatus::Failed);
    assert_eq!(done.error.as_ref().map(|e| e.code.as_str()), Some("LOCK_EXPIRED"));
    // The fenced shard result was never committed.
    assert_ne!(shard(&done, "ord-0").status, ShardStatus::Succeeded);
    assert_eq!(h.executor.attempts("ord-1"), 0);

    // Failed under a fresh grant, which was then given back.
    let events = settled(&h, id).await;
    assert_eq!(count(&events, EventType::LockLost), 1);
    assert_eq!(count(&events, EventType::LockReleased), 1);
    assert!(h.locks.current(&lock_resource_for("backfill")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_migration_timeout_between_shards() {
    let config = test_config()
        .with_max_parallel_shards(1)
        .with_lock_ttl(Duration::from_secs(600))
        .with_migration_timeout(Duration::from_secs(60));
    let h = harness(config, mongo_topology("orders", "ord-", 2));
    let gate = h.executor.gate("ord-0");

    let id = h.submit("backfill", "orders").await.unwrap();
    gate.wait_entered().await;
    h.clock.advance(Duration::from_secs(120));
    gate.open();

    let done = terminal(&h, id).await;
    assert_eq!(done.status, MigrationStatus::Failed);
    assert_eq!(done.error.as_ref().map(|e| e.code.as_str()), Some("TIMEOUT"));
    assert_eq!(shard(&done, "ord-0").status, ShardStatus::Succeeded);
    assert_eq!(h.executor.attempts("ord-1"), 0);

    settled(&h, id).await;
    assert!(h.locks.current(&lock_resource_for("backfill")).await.unwrap().is_none());
}

// ============================================================================
// 6. Recovery
// ============================================================================

#[tokio::test]
async fn test_recover_runs_only_unfinished_shards() {
    let h = harness(test_config(), mongo_topology("orders", "ord-", 2));
    let crashed = persist(
        &h,
        "backfill",
        "orders",
        &[MigrationStatus::Locking, MigrationStatus::Running],
    )
    .await;
    let mut finished = ShardProgress::pending("ord-0", h.clock.now_ms());
    finished.status = ShardStatus::Succeeded;
    finished.attempt_count = 1;
    h.store.record_shard_progress(crashed.id, finished).await.unwrap();
    h.store
        .record_shard_progress(crashed.id, ShardProgress::pending("ord-1", h.clock.now_ms()))
        .await
        .unwrap();
    let queued = persist(&h, "add_index", "orders", &[]).await;

    let recovered = h.orchestrator.recover(&RequestContext::new()).await.unwrap();
    assert_eq!(recovered.len(), 2);

    let done = terminal(&h, crashed.id).await;
    assert_eq!(done.status, MigrationStatus::Succeeded);
    assert_eq!(shard(&done, "ord-0").attempt_count, 1);
    assert_eq!(shard(&done, "ord-1").attempt_count, 1);
    assert_eq!(terminal(&h, queued.id).await.status, MigrationStatus::Succeeded);

    let crashed_calls = h
        .executor
        .calls()
        .into_iter()
        .filter(|c| c.migration_id == crashed.id)
        .collect::<Vec<_>>();
    assert_eq!(crashed_calls.len(), 1);
    assert_eq!(crashed_calls[0].shard_id, "ord-1");

    let events = settled(&h, crashed.id).await;
    assert_eq!(count(&events, EventType::Recovered), 1);
}

#[tokio::test]
async fn test_recover_leaves_migration_locked_elsewhere() {
    let h = harness(test_config(), mongo_topology("orders", "ord-", 1));
    let running = persist(
        &h,
        "backfill",
        "orders",
        &[MigrationStatus::Locking, MigrationStatus::Running],
    )
    .await;
    h.locks
        .acquire(&running.lock_resource(), "worker-b", Duration::from_secs(600))
        .await
        .unwrap();

    h.orchestrator.recover(&RequestContext::new()).await.unwrap();
    idle(&h).await;

    let untouched = h.orchestrator.get_status(running.id).await.unwrap();
    assert_eq!(untouched.status, MigrationStatus::Running);
    assert!(untouched.error.is_none());
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn test_two_workers_recovering_run_each_shard_once() {
    let h = harness(test_config(), mongo_topology("orders", "ord-", 2));
    let peer = h
        .worker(test_config().with_worker_id("worker-b"), h.executor.clone())
        .unwrap();
    let pending = persist(&h, "backfill", "orders", &[]).await;

    let ctx = RequestContext::new();
    let (a, b) = tokio::join!(h.orchestrator.recover(&ctx), peer.recover(&ctx));
    assert_eq!(a.unwrap(), vec![pending.id]);
    assert_eq!(b.unwrap(), vec![pending.id]);

    assert_eq!(terminal(&h, pending.id).await.status, MigrationStatus::Succeeded);
    idle(&h).await;
    wait_for_result(
        || async { peer.health() },
        |health| health.active_migrations == 0,
        WAIT,
    )
    .await
    .unwrap();
    assert_eq!(h.executor.attempts("ord-0"), 1);
    assert_eq!(h.executor.attempts("ord-1"), 1);
}

#[tokio::test]
async fn test_recover_fails_shards_dropped_from_topology() {
    let h = harness(test_config(), mongo_topology("orders", "ord-", 1));
    let crashed = persist(
        &h,
        "backfill",
        "orders",
        &[MigrationStatus::Locking, MigrationStatus::Running],
    )
    .await;
    h.store
        .record_shard_progress(crashed.id, ShardProgress::pending("ord-9", h.clock.now_ms()))
        .await
        .unwrap();

    h.orchestrator.recover(&RequestContext::new()).await.unwrap();
    let done = terminal(&h, crashed.id).await;

    assert_eq!(done.status, MigrationStatus::PartiallyFailed);
    let dropped = shard(&done, "ord-9");
    assert_eq!(dropped.status, ShardStatus::Failed);
    assert_eq!(dropped.last_error.as_deref(), Some("shard no longer in topology"));
    assert_eq!(shard(&done, "ord-0").status, ShardStatus::Succeeded);
}

// ============================================================================
// 7. Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_drains_and_rejects_new_work() {
    let topology = mongo_topology("a", "a", 1).with_shard(ShardEntry::new(
        "b0",
        DatabaseType::MongoDb,
        "b",
        "mongodb://b0:27017",
    ));
    let h = harness(test_config().with_max_parallel_migrations(1), topology);
    let gate = h.executor.gate("a0");

    let running = h.submit("first", "a").await.unwrap();
    let queued = h.submit("second", "b").await.unwrap();
    gate.wait_entered().await;

    let orchestrator = h.orchestrator.clone();
    let stopping = tokio::spawn(async move { orchestrator.shutdown().await });
    wait_for_result(|| async { h.orchestrator.health() }, |health| !health.running, WAIT)
        .await
        .unwrap();

    let err = h.submit("third", "a").await.unwrap_err();
    assert!(matches!(err, Error::Internal(_)));

    // In-flight work finishes before shutdown returns.
    gate.open();
    stopping.await.unwrap();
    assert_eq!(h.orchestrator.get_status(running).await.unwrap().status, MigrationStatus::Succeeded);
    assert_eq!(h.orchestrator.get_status(queued).await.unwrap().status, MigrationStatus::Pending);
    assert_eq!(h.orchestrator.health().open_connections, 0);

    // A fresh worker picks the queued migration up.
    let next = h.worker(test_config(), Arc::new(ScriptedExecutor::new())).unwrap();
    assert_eq!(next.recover(&RequestContext::new()).await.unwrap(), vec![queued]);
    let done = wait_for_status(&next, queued, |m| m.status.is_terminal(), WAIT)
        .await
        .unwrap();
    assert_eq!(done.status, MigrationStatus::Succeeded);
}

#[tokio::test]
async fn test_prometheus_render_after_runs() {
    let h = harness(test_config(), mongo_topology("orders", "ord-", 2));
    h.executor.fail_always("ord-1", Error::Validation("bad".into()));
    let id = h.submit("add_index", "orders").await.unwrap();
    terminal(&h, id).await;
    settled(&h, id).await;

    let text = h.orchestrator.metrics().render_prometheus();
    assert!(text.contains("mongodb"));
    let snapshot = h.orchestrator.metrics().snapshot();
    assert_eq!(snapshot.completed(), 1);
    assert_eq!(snapshot.shard_failures, 1);
}
