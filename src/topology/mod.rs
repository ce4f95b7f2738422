//! Where migrations run: shard topology and database connections.

pub mod connection;
pub mod registry;

pub use connection::{
    coordination_indexes, ensure_coordination_indexes, redact_uri, ClientFactory, ConnectionRegistry,
    DatabaseClient, InMemoryClientFactory, InMemoryDatabase, IndexSpec, Versioned, WriteCondition,
    MIGRATION_EVENTS, MIGRATION_LOCKS, MIGRATION_STATE,
};
pub use registry::{
    FileShardSource, KeyRange, ShardEndpoint, ShardEntry, ShardRegistry, ShardSource, ShardTopology,
    StaticShardSource,
};
