//! Shard execution seam.
//!
//! The orchestrator never looks inside a shard's unit of work. It hands a
//! [`ShardTask`] (connected client plus migration identity) to a
//! [`ShardExecutor`] and classifies the returned error with
//! [`Error::is_retryable`](crate::error::Error::is_retryable).

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::topology::{DatabaseClient, KeyRange, ShardEndpoint};
use crate::types::{DatabaseType, Metadata, Migration, MigrationId, MigrationType, ShardId};

/// Everything an executor needs to run one shard of one migration.
#[derive(Debug, Clone)]
pub struct ShardTask {
    pub migration_id: MigrationId,
    pub migration_name: String,
    pub migration_version: String,
    pub migration_type: MigrationType,
    pub database_type: DatabaseType,
    pub database: String,
    pub shard_id: ShardId,
    pub key_range: KeyRange,
    /// 1-based attempt number for this shard.
    pub attempt: u32,
    pub batch_size: usize,
    pub metadata: Metadata,
    /// Verified client for the shard's connection URI.
    pub client: Arc<dyn DatabaseClient>,
}

impl ShardTask {
    pub(crate) fn new(
        migration: &Migration,
        endpoint: &ShardEndpoint,
        attempt: u32,
        batch_size: usize,
        client: Arc<dyn DatabaseClient>,
    ) -> Self {
        Self {
            migration_id: migration.id,
            migration_name: migration.name.clone(),
            migration_version: migration.version.clone(),
            migration_type: migration.migration_type,
            database_type: migration.database_type,
            database: migration.database.clone(),
            shard_id: endpoint.shard_id.clone(),
            key_range: endpoint.key_range.clone(),
            attempt,
            batch_size,
            metadata: migration.metadata.clone(),
            client,
        }
    }
}

/// Runs the actual schema or data change on one shard.
///
/// Implementations must be idempotent per `(migration_id, shard_id)`: a
/// recovered migration may re-run a shard whose previous result was never
/// recorded.
#[async_trait]
pub trait ShardExecutor: Send + Sync + std::fmt::Debug {
    async fn execute(&self, task: &ShardTask) -> Result<()>;
}

/// Executor that verifies connectivity and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpShardExecutor;

#[async_trait]
impl ShardExecutor for NoOpShardExecutor {
    async fn execute(&self, task: &ShardTask) -> Result<()> {
        task.client.ping().await?;
        tracing::debug!(
            migration_id = %task.migration_id,
            shard_id = %task.shard_id,
            "No-op shard execution"
        );
        Ok(())
    }
}
