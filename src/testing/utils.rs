use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use super::executor::ScriptedExecutor;
use crate::clock::{Clock, ManualClock};
use crate::config::{CoordinatorConfig, RetryPolicy};
use crate::context::RequestContext;
use crate::coordination::{
    EventStore, InMemoryEventStore, InMemoryLockManager, InMemoryMigrationStore, LockManager, MigrationStateStore,
};
use crate::engine::MigrationOrchestrator;
use crate::error::Result;
use crate::topology::{ConnectionRegistry, InMemoryClientFactory, ShardEntry, ShardRegistry, ShardTopology};
use crate::types::{DatabaseType, Migration, MigrationId, MigrationSpec};

/// Wall-clock start of every [`TestHarness`] clock.
pub const TEST_EPOCH_MS: u64 = 1_700_000_000_000;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Poll `action` until `predicate` accepts its output or `timeout` passes.
pub async fn wait_for_result<F, Fut, T, P>(mut action: F, predicate: P, timeout: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        sleep(POLL_INTERVAL).await;
    }
    None
}

/// Wait until the migration record satisfies `predicate`.
pub async fn wait_for_status<P>(
    orchestrator: &MigrationOrchestrator,
    id: MigrationId,
    predicate: P,
    timeout: Duration,
) -> Option<Migration>
where
    P: Fn(&Migration) -> bool,
{
    wait_for_result(
        || orchestrator.get_status(id),
        |r| r.as_ref().map(&predicate).unwrap_or(false),
        timeout,
    )
    .await
    .and_then(|r| r.ok())
}

/// Wait until the migration reaches a terminal status.
pub async fn wait_for_terminal(
    orchestrator: &MigrationOrchestrator,
    id: MigrationId,
    timeout: Duration,
) -> Option<Migration> {
    wait_for_status(orchestrator, id, |m| m.status.is_terminal(), timeout).await
}

/// Configuration for fast scenarios: immediate retries, three attempts.
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig::default()
        .with_worker_id("worker-a")
        .with_retry_policy(RetryPolicy::immediate(3))
        .with_lock_ttl(Duration::from_secs(30))
}

/// `count` MongoDB shards of `database` named `<prefix>0..`.
pub fn mongo_topology(database: &str, prefix: &str, count: usize) -> ShardTopology {
    (0..count).fold(ShardTopology::new(), |topology, i| {
        topology.with_shard(ShardEntry::new(
            format!("{}{}", prefix, i),
            DatabaseType::MongoDb,
            database,
            format!("mongodb://{}{}:27017", prefix, i),
        ))
    })
}

/// An orchestrator over in-memory stores, a manual clock and a scripted
/// executor, with every collaborator reachable from the test.
#[derive(Debug)]
pub struct TestHarness {
    pub orchestrator: MigrationOrchestrator,
    pub executor: Arc<ScriptedExecutor>,
    pub factory: Arc<InMemoryClientFactory>,
    pub store: Arc<InMemoryMigrationStore>,
    pub locks: Arc<InMemoryLockManager>,
    pub events: Arc<InMemoryEventStore>,
    pub shards: Arc<ShardRegistry>,
    pub clock: Arc<ManualClock>,
}

impl TestHarness {
    pub fn new(config: CoordinatorConfig, topology: ShardTopology) -> Result<Self> {
        let clock = Arc::new(ManualClock::new(TEST_EPOCH_MS));
        let executor = Arc::new(ScriptedExecutor::new());
        let factory = Arc::new(InMemoryClientFactory::new());
        let store = Arc::new(InMemoryMigrationStore::new(clock.clone()));
        let locks = Arc::new(InMemoryLockManager::new(clock.clone()));
        let events = Arc::new(InMemoryEventStore::new());
        let shards = Arc::new(ShardRegistry::with_topology(topology));

        let orchestrator = assemble(&clock, &store, &locks, &events, &shards, &factory, config, executor.clone())?;
        Ok(Self {
            orchestrator,
            executor,
            factory,
            store,
            locks,
            events,
            shards,
            clock,
        })
    }

    /// Another worker sharing this harness's stores, clock and databases.
    pub fn worker(&self, config: CoordinatorConfig, executor: Arc<ScriptedExecutor>) -> Result<MigrationOrchestrator> {
        assemble(
            &self.clock,
            &self.store,
            &self.locks,
            &self.events,
            &self.shards,
            &self.factory,
            config,
            executor,
        )
    }

    /// Submit a MongoDB migration with a fresh request context.
    pub async fn submit(&self, name: &str, database: &str) -> Result<MigrationId> {
        let spec = MigrationSpec::new(name, "1", DatabaseType::MongoDb, database);
        self.orchestrator.submit_migration(spec, &RequestContext::new()).await
    }
}

#[allow(clippy::too_many_arguments)]
fn assemble(
    clock: &Arc<ManualClock>,
    store: &Arc<InMemoryMigrationStore>,
    locks: &Arc<InMemoryLockManager>,
    events: &Arc<InMemoryEventStore>,
    shards: &Arc<ShardRegistry>,
    factory: &Arc<InMemoryClientFactory>,
    config: CoordinatorConfig,
    executor: Arc<ScriptedExecutor>,
) -> Result<MigrationOrchestrator> {
    let clock: Arc<dyn Clock> = clock.clone();
    let store: Arc<dyn MigrationStateStore> = store.clone();
    let locks: Arc<dyn LockManager> = locks.clone();
    let events: Arc<dyn EventStore> = events.clone();
    MigrationOrchestrator::builder(config)
        .clock(clock)
        .state_store(store)
        .lock_manager(locks)
        .event_store(events)
        .shard_registry(shards.clone())
        .connections(Arc::new(ConnectionRegistry::new(factory.clone())))
        .executor(executor)
        .build()
}
