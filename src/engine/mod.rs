//! Migration execution engine.
//!
//! - [`orchestrator`]: public API, admission queue, lifecycle
//! - `runner`: per-migration driver (lock, shards, aggregate)
//! - [`executor`]: the opaque per-shard unit of work
//!
//! [`bootstrap`] wires a production orchestrator from configuration: shard
//! topology from `SHARD_CONFIG_PATH` (or the connection defaults), a
//! store-backed lock on the MongoDB coordination database with its indexes
//! in place, and optionally a file-backed state store.

pub mod executor;
pub mod orchestrator;
mod runner;

pub use executor::{NoOpShardExecutor, ShardExecutor, ShardTask};
pub use orchestrator::{HealthStatus, MigrationOrchestrator, OrchestratorBuilder};

use std::path::PathBuf;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::coordination::{FileMigrationStore, StoreLockManager};
use crate::error::Result;
use crate::topology::{
    ensure_coordination_indexes, redact_uri, ClientFactory, ConnectionRegistry, FileShardSource, ShardRegistry,
    ShardSource, ShardTopology, StaticShardSource,
};
use crate::types::DatabaseType;

/// Assemble an orchestrator from configuration.
///
/// The coordination database must be reachable: its indexes are created
/// before anything else happens. With `state_dir` set, migration records
/// survive restarts in that directory (single process only).
pub async fn bootstrap(
    config: CoordinatorConfig,
    factory: Arc<dyn ClientFactory>,
    executor: Arc<dyn ShardExecutor>,
    state_dir: Option<PathBuf>,
) -> Result<MigrationOrchestrator> {
    config.validate()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let source: Arc<dyn ShardSource> = match &config.shards.config_path {
        Some(path) => Arc::new(FileShardSource::new(path).with_fallback_defaults(&config.database)),
        None => Arc::new(StaticShardSource::new(ShardTopology::from_database_config(
            &config.database,
        ))),
    };
    let shards = Arc::new(ShardRegistry::load(source).await?);

    let connections = Arc::new(ConnectionRegistry::new(factory));
    let coordination_uri = config.database.mongodb_connection_uri();
    let coordination = connections.client(DatabaseType::MongoDb, &coordination_uri).await?;
    ensure_coordination_indexes(coordination.as_ref()).await?;
    tracing::info!(uri = %redact_uri(&coordination_uri), "Coordination store ready");

    let mut builder = MigrationOrchestrator::builder(config)
        .clock(clock.clone())
        .lock_manager(Arc::new(StoreLockManager::new(coordination, clock.clone())))
        .shard_registry(shards)
        .connections(connections)
        .executor(executor);
    if let Some(dir) = state_dir {
        tracing::info!(dir = %dir.display(), "Using file-backed migration state");
        builder = builder.state_store(Arc::new(FileMigrationStore::open(dir, clock).await?));
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::coordination::EventType;
    use crate::topology::{InMemoryClientFactory, MIGRATION_LOCKS};
    use crate::types::{MigrationSpec, MigrationStatus};
    use std::time::Duration;

    #[tokio::test]
    async fn test_bootstrap_from_shard_file() {
        let dir = tempfile::tempdir().unwrap();
        let shard_file = dir.path().join("shards.toml");
        tokio::fs::write(
            &shard_file,
            r#"
[[shards]]
shard_id = "orders-0"
database_type = "mongodb"
database = "orders"
connection_uri = "mongodb://orders-0:27017"

[[shards]]
shard_id = "orders-1"
database_type = "mongodb"
database = "orders"
connection_uri = "mongodb://orders-1:27017"
"#,
        )
        .await
        .unwrap();

        let mut config = CoordinatorConfig::default();
        config.shards.config_path = Some(shard_file);
        config.retry = crate::config::RetryPolicy::immediate(2);
        let factory = Arc::new(InMemoryClientFactory::new());
        let coordination_uri = config.database.mongodb_connection_uri();

        let orchestrator = bootstrap(
            config,
            factory.clone(),
            Arc::new(NoOpShardExecutor),
            Some(dir.path().join("state")),
        )
        .await
        .unwrap();

        let coordination = factory.database(&coordination_uri).unwrap();
        assert!(!coordination.indexes(MIGRATION_LOCKS).is_empty());

        let ctx = RequestContext::new();
        let id = orchestrator
            .submit_migration(MigrationSpec::new("add_index", "1", DatabaseType::MongoDb, "orders"), &ctx)
            .await
            .unwrap();
        let done = crate::testing::wait_for_terminal(&orchestrator, id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, MigrationStatus::Succeeded);
        assert_eq!(done.shards.len(), 2);
        // Acquired and released through the coordination database.
        assert!(coordination.keys(MIGRATION_LOCKS).is_empty());
        let events = orchestrator.events(id).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == EventType::LockReleased));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_bootstrap_fails_without_coordination_store() {
        let config = CoordinatorConfig::default();
        let factory = Arc::new(InMemoryClientFactory::new());
        factory.refuse(config.database.mongodb_connection_uri());

        let result = bootstrap(config, factory, Arc::new(NoOpShardExecutor), None).await;
        assert!(matches!(result, Err(crate::error::Error::DatabaseConnection(_))));
    }
}
