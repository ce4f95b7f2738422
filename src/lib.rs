//! Coordination engine for data migrations across sharded MongoDB and
//! PostgreSQL deployments.
//!
//! This crate decides *when* and *where* a migration runs, never *what* it
//! does to the data. It provides:
//! - **Admission control** bounding concurrent migrations and shard operations
//! - **Distributed locks** with TTL, renewal and fencing tokens
//! - **Compare-and-swap state transitions** so many workers can share one store
//! - **An append-only audit trail** of every transition and shard outcome
//! - **Recovery** of migrations left behind by a crashed worker
//!
//! # Example
//!
//! ```rust,no_run
//! use migration_coordinator::{
//!     CoordinatorConfig, DatabaseType, MigrationOrchestrator, MigrationSpec, RequestContext,
//! };
//! use migration_coordinator::topology::{ConnectionRegistry, InMemoryClientFactory};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoordinatorConfig::from_env()?;
//!     migration_coordinator::telemetry::init_tracing(&config.log)?;
//!
//!     let connections = Arc::new(ConnectionRegistry::new(Arc::new(InMemoryClientFactory::new())));
//!     let orchestrator = MigrationOrchestrator::builder(config)
//!         .connections(connections)
//!         .build()?;
//!
//!     // Pick up whatever a previous run left unfinished.
//!     orchestrator.recover(&RequestContext::new()).await?;
//!
//!     let spec = MigrationSpec::new("add_user_email_index", "1", DatabaseType::MongoDb, "users");
//!     let id = orchestrator.submit_migration(spec, &RequestContext::new()).await?;
//!     println!("status: {}", orchestrator.get_status(id).await?.status);
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Application Layer                │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │          MigrationOrchestrator              │
//! │  • submit_migration / cancel_migration      │
//! │  • get_status / list_migrations / events    │
//! │  • recover / shutdown / health              │
//! └─────────────────────────────────────────────┘
//!        │               │                │
//!        ▼               ▼                ▼
//! ┌────────────┐  ┌─────────────┐  ┌─────────────┐
//! │ Admission  │  │ Coordination│  │  Topology   │
//! │ (slots +   │  │ (state, lock│  │ (shards +   │
//! │  throttle) │  │  events)    │  │  clients)   │
//! └────────────┘  └─────────────┘  └─────────────┘
//!                                         │
//!                                         ▼
//!                                  ShardExecutor
//! ```
//!
//! # Consistency Model
//!
//! - **Transitions**: linearized by compare-and-swap on the state store
//! - **Shard results**: committed only after re-validating the lock's fencing token
//! - **Cancellation and timeouts**: cooperative, checked between shard executions
//! - **Audit events**: best effort, never fail the migration

pub mod clock;
pub mod config;
pub mod context;
pub mod coordination;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod telemetry;
pub mod testing;
pub mod topology;
pub mod types;

// Re-export main types for convenience
pub use config::{CoordinatorConfig, DatabaseConfig, LogConfig, RetryPolicy, ShardConfig};
pub use context::RequestContext;
pub use engine::{
    bootstrap, HealthStatus, MigrationOrchestrator, NoOpShardExecutor, OrchestratorBuilder, ShardExecutor,
    ShardTask,
};
pub use error::{Error, Result};
pub use types::{
    DatabaseType, Migration, MigrationFailure, MigrationFilter, MigrationId, MigrationSpec, MigrationStatus,
    MigrationType, ShardProgress, ShardStatus,
};

// Re-export coordination types
pub use coordination::{
    AdmissionController, EventLog, EventStore, EventType, LockHandle, LockManager, MigrationEvent,
    MigrationLock, MigrationStateStore, TransitionUpdate,
};

// Re-export topology types
pub use topology::{ClientFactory, ConnectionRegistry, DatabaseClient, ShardEndpoint, ShardRegistry, ShardTopology};

// Re-export metrics types
pub use metrics::{
    CoordinatorMetrics, Counter, DatabaseCounter, DatabaseGauge, Gauge, Histogram, HistogramSnapshot, MetricsSnapshot,
};
