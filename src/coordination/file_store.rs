//! File-backed migration state store.
//!
//! Durable storage for migration records so a restarted worker can recover
//! in-flight migrations.
//!
//! # Persistence Guarantees
//!
//! - Every mutation is persisted before it returns
//! - Records are written atomically (write-to-temp, fsync, then rename)
//! - The on-disk record is written FIRST, the in-memory index second
//! - Compare-and-swap checks and the write happen under one writer lock
//!
//! # Storage Format
//!
//! ```text
//! <base_dir>/
//!   └── migrations/
//!       ├── 5b0e8c1e-....bin     # bincode-encoded Migration
//!       └── 9f3a77d2-....bin
//! ```
//!
//! The writer lock is process-local: one file store must be owned by one
//! worker process. Multi-process deployments use a shared database store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::state_store::{
    apply_cancellation, apply_shard_progress, apply_transition, check_unique, MigrationStateStore,
    TransitionUpdate,
};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::types::{Migration, MigrationFilter, MigrationId, MigrationStatus, ShardProgress};

/// File-based implementation for production use.
#[derive(Debug)]
pub struct FileMigrationStore {
    base_dir: PathBuf,
    /// Read index mirroring the files on disk.
    index: RwLock<HashMap<MigrationId, Migration>>,
    /// Serializes read-modify-write cycles.
    writer: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl FileMigrationStore {
    /// Open (or create) a store rooted at `base_dir` and load existing records.
    pub async fn open(base_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let base_dir = base_dir.into();
        let dir = base_dir.join("migrations");
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Storage(format!("failed to create {}: {}", dir.display(), e)))?;

        let store = Self {
            base_dir,
            index: RwLock::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(()),
            clock,
        };
        let loaded = store.load_all().await?;
        tracing::info!(
            count = loaded.len(),
            dir = %store.base_dir.display(),
            "Loaded migration records from disk"
        );
        *store.index.write() = loaded.into_iter().map(|m| (m.id, m)).collect();
        Ok(store)
    }

    fn record_path(&self, id: MigrationId) -> PathBuf {
        self.base_dir.join("migrations").join(format!("{}.bin", id))
    }

    /// Atomically write a file (write to temp, then rename).
    async fn atomic_write(&self, path: &Path, content: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Storage(format!("failed to create temp file: {}", e)))?;
        file.write_all(content)
            .await
            .map_err(|e| Error::Storage(format!("failed to write temp file: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| Error::Storage(format!("failed to sync temp file: {}", e)))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| Error::Storage(format!("failed to rename file: {}", e)))?;
        Ok(())
    }

    async fn persist(&self, migration: &Migration) -> Result<()> {
        let content = bincode::serialize(migration)?;
        self.atomic_write(&self.record_path(migration.id), &content).await?;
        tracing::debug!(
            migration_id = %migration.id,
            status = %migration.status,
            "Persisted migration record"
        );
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Migration>> {
        let dir = self.base_dir.join("migrations");
        let mut migrations = Vec::new();

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| Error::Storage(format!("failed to read {}: {}", dir.display(), e)))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("failed to read dir entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().map(|e| e == "bin").unwrap_or(false) {
                match fs::read(&path).await {
                    Ok(content) => match bincode::deserialize::<Migration>(&content) {
                        Ok(migration) => migrations.push(migration),
                        Err(e) => {
                            tracing::warn!(
                                path = ?path,
                                error = %e,
                                "Failed to deserialize migration file, skipping"
                            );
                        }
                    },
                    Err(e) => {
                        tracing::warn!(path = ?path, error = %e, "Failed to read migration file, skipping");
                    }
                }
            }
        }
        Ok(migrations)
    }

    /// Read-modify-write one record under the writer lock.
    async fn mutate<F>(&self, id: MigrationId, f: F) -> Result<Migration>
    where
        F: FnOnce(&mut Migration, u64) -> Result<()> + Send,
    {
        let _writer = self.writer.lock().await;
        let mut updated = self
            .index
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::MigrationNotFound(id))?;
        f(&mut updated, self.clock.now_ms())?;

        // Disk first, then the index.
        self.persist(&updated).await?;
        self.index.write().insert(id, updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl MigrationStateStore for FileMigrationStore {
    async fn create(&self, migration: &Migration) -> Result<()> {
        let _writer = self.writer.lock().await;
        {
            let index = self.index.read();
            check_unique(index.values(), migration)?;
        }
        self.persist(migration).await?;
        self.index.write().insert(migration.id, migration.clone());
        Ok(())
    }

    async fn transition(
        &self,
        id: MigrationId,
        from: &[MigrationStatus],
        to: MigrationStatus,
        update: TransitionUpdate,
    ) -> Result<Migration> {
        self.mutate(id, |m, now| apply_transition(m, from, to, update, now))
            .await
    }

    async fn record_shard_progress(&self, id: MigrationId, progress: ShardProgress) -> Result<Migration> {
        self.mutate(id, |m, now| apply_shard_progress(m, progress, now)).await
    }

    async fn request_cancellation(&self, id: MigrationId) -> Result<Migration> {
        self.mutate(id, apply_cancellation).await
    }

    async fn get(&self, id: MigrationId) -> Result<Migration> {
        self.index
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::MigrationNotFound(id))
    }

    async fn list(&self, filter: &MigrationFilter) -> Result<Vec<Migration>> {
        let all: Vec<Migration> = self.index.read().values().cloned().collect();
        Ok(filter.apply(all))
    }

    async fn find_latest(&self, name: &str, version: &str) -> Result<Option<Migration>> {
        Ok(self
            .index
            .read()
            .values()
            .filter(|m| m.name == name && m.version == version)
            .max_by_key(|m| m.attempt)
            .cloned())
    }
}
