//! Migration state store.
//!
//! The store is the single source of truth for migration records. Status
//! changes go through [`MigrationStateStore::transition`], a compare-and-swap
//! that only succeeds when the current status is in the caller's expected set
//! and the edge is a forward edge of the state machine. Two workers racing to
//! advance the same migration cannot both win.
//!
//! Terminal records are immutable: transitions, shard progress and
//! cancellation requests against them are rejected.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::types::{
    Migration, MigrationFailure, MigrationFilter, MigrationId, MigrationStatus, ShardProgress,
};

/// Fields written together with a status transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionUpdate {
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub error: Option<MigrationFailure>,
    /// Replaces the shard list when set.
    pub shards: Option<Vec<ShardProgress>>,
}

impl TransitionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started_at(mut self, ms: u64) -> Self {
        self.started_at = Some(ms);
        self
    }

    pub fn completed_at(mut self, ms: u64) -> Self {
        self.completed_at = Some(ms);
        self
    }

    pub fn error(mut self, error: MigrationFailure) -> Self {
        self.error = Some(error);
        self
    }

    pub fn shards(mut self, shards: Vec<ShardProgress>) -> Self {
        self.shards = Some(shards);
        self
    }
}

/// Durable migration records.
#[async_trait]
pub trait MigrationStateStore: Send + Sync + std::fmt::Debug {
    /// Insert a new record. Unique on name + version + attempt.
    async fn create(&self, migration: &Migration) -> Result<()>;

    /// Compare-and-swap the status.
    async fn transition(
        &self,
        id: MigrationId,
        from: &[MigrationStatus],
        to: MigrationStatus,
        update: TransitionUpdate,
    ) -> Result<Migration>;

    /// Insert or replace one shard's progress record.
    async fn record_shard_progress(&self, id: MigrationId, progress: ShardProgress) -> Result<Migration>;

    /// Persist a cancellation request on a non-terminal migration.
    async fn request_cancellation(&self, id: MigrationId) -> Result<Migration>;

    async fn get(&self, id: MigrationId) -> Result<Migration>;

    /// Records matching the filter, oldest first.
    async fn list(&self, filter: &MigrationFilter) -> Result<Vec<Migration>>;

    /// Highest attempt for a name + version.
    async fn find_latest(&self, name: &str, version: &str) -> Result<Option<Migration>>;
}

/// Validate and apply a status transition in place.
pub(crate) fn apply_transition(
    migration: &mut Migration,
    from: &[MigrationStatus],
    to: MigrationStatus,
    update: TransitionUpdate,
    now_ms: u64,
) -> Result<()> {
    if !from.contains(&migration.status) || !migration.status.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            id: migration.id,
            from: migration.status,
            to,
        });
    }

    migration.status = to;
    if let Some(started_at) = update.started_at {
        migration.started_at = Some(started_at);
    }
    if let Some(error) = update.error {
        migration.error = Some(error);
    }
    if let Some(shards) = update.shards {
        migration.shards = shards;
    }
    if let Some(completed_at) = update.completed_at {
        migration.completed_at = Some(completed_at);
    } else if to.is_terminal() {
        migration.completed_at = Some(now_ms);
    }
    migration.updated_at = now_ms;
    Ok(())
}

/// Upsert a shard progress record in place.
pub(crate) fn apply_shard_progress(migration: &mut Migration, progress: ShardProgress, now_ms: u64) -> Result<()> {
    reject_terminal(migration)?;
    match migration.shards.iter_mut().find(|s| s.shard_id == progress.shard_id) {
        Some(slot) => *slot = progress,
        None => migration.shards.push(progress),
    }
    migration.updated_at = now_ms;
    Ok(())
}

/// Mark cancellation requested in place.
pub(crate) fn apply_cancellation(migration: &mut Migration, now_ms: u64) -> Result<()> {
    reject_terminal(migration)?;
    migration.cancel_requested = true;
    migration.updated_at = now_ms;
    Ok(())
}

fn reject_terminal(migration: &Migration) -> Result<()> {
    if migration.status.is_terminal() {
        return Err(Error::InvalidTransition {
            id: migration.id,
            from: migration.status,
            to: migration.status,
        });
    }
    Ok(())
}

pub(crate) fn check_unique<'a, I>(existing: I, candidate: &Migration) -> Result<()>
where
    I: IntoIterator<Item = &'a Migration>,
{
    for m in existing {
        if m.id == candidate.id
            || (m.name == candidate.name && m.version == candidate.version && m.attempt == candidate.attempt)
        {
            return Err(Error::MigrationAlreadyExists {
                name: candidate.name.clone(),
                version: candidate.version.clone(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// In-memory store. Each operation runs under one write lock.
#[derive(Debug)]
pub struct InMemoryMigrationStore {
    migrations: RwLock<HashMap<MigrationId, Migration>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryMigrationStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            migrations: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.migrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.read().is_empty()
    }

    fn mutate<F>(&self, id: MigrationId, f: F) -> Result<Migration>
    where
        F: FnOnce(&mut Migration, u64) -> Result<()>,
    {
        let now = self.clock.now_ms();
        let mut migrations = self.migrations.write();
        let migration = migrations.get_mut(&id).ok_or(Error::MigrationNotFound(id))?;
        // Work on a copy so a rejected update leaves the record untouched.
        let mut updated = migration.clone();
        f(&mut updated, now)?;
        *migration = updated.clone();
        Ok(updated)
    }
}

#[async_trait]
impl MigrationStateStore for InMemoryMigrationStore {
    async fn create(&self, migration: &Migration) -> Result<()> {
        let mut migrations = self.migrations.write();
        check_unique(migrations.values(), migration)?;
        migrations.insert(migration.id, migration.clone());
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
    }

    async fn record_shard_progress(&self, id: MigrationId, progress: ShardProgress) -> Result<Migration> {
        self.mutate(id, |m, now| apply_shard_progress(m, progress, now))
    }

    async fn request_cancellation(&self, id: MigrationId) -> Result<Migration> {
        self.mutate(id, apply_cancellation)
    }

    async fn get(&self, id: MigrationId) -> Result<Migration> {
        self.migrations
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::MigrationNotFound(id))
    }

    async fn list(&self, filter: &MigrationFilter) -> Result<Vec<Migration>> {
        let all: Vec<Migration> = self.migrations.read().values().cloned().collect();
        Ok(filter.apply(all))
    }

    async fn find_latest(&self, name: &str, version: &str) -> Result<Option<Migration>> {
        Ok(self
            .migrations
            .read()
            .values()
            .filter(|m| m.name == name && m.version == version)
            .max_by_key(|m| m.attempt)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{DatabaseType, MigrationSpec, ShardStatus};

    fn store() -> (Arc<ManualClock>, InMemoryMigrationStore) {
        let clock = Arc::new(ManualClock::default());
        (clock.clone(), InMemoryMigrationStore::new(clock))
    }

    fn migration(name: &str, attempt: u32) -> Migration {
        let spec = MigrationSpec::new(name, "1", DatabaseType::MongoDb, "orders");
        Migration::from_spec(&spec, attempt, 0)
    }

    #[tokio::test]
    async fn test_create_is_unique_on_name_version_attempt() {
        let (_, store) = store();
        store.create(&migration("a", 1)).await.unwrap();

        let err = store.create(&migration("a", 1)).await.unwrap_err();
        assert!(matches!(err, Error::MigrationAlreadyExists { .. }));

        store.create(&migration("a", 2)).await.unwrap();
        let latest = store.find_latest("a", "1").await.unwrap().unwrap();
        assert_eq!(latest.attempt, 2);
        assert!(store.find_latest("a", "2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_compare_and_swap() {
        let (clock, store) = store();
        let m = migration("a", 1);
        store.create(&m).await.unwrap();

        let locking = store
            .transition(m.id, &[MigrationStatus::Pending], MigrationStatus::Locking, TransitionUpdate::new())
            .await
            .unwrap();
        assert_eq!(locking.status, MigrationStatus::Locking);

        // A second worker racing on the same edge loses.
        let err = store
            .transition(m.id, &[MigrationStatus::Pending], MigrationStatus::Locking, TransitionUpdate::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::InvalidTransition {
                id: m.id,
                from: MigrationStatus::Locking,
                to: MigrationStatus::Locking
            }
        );

        clock.advance(std::time::Duration::from_millis(5));
        let running = store
            .transition(
                m.id,
                &[MigrationStatus::Locking],
                MigrationStatus::Running,
                TransitionUpdate::new().started_at(clock.now_ms()),
            )
            .await
            .unwrap();
        assert_eq!(running.started_at, Some(clock.now_ms()));
        assert!(running.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_terminal_records_are_immutable() {
        let (_, store) = store();
        let m = migration("a", 1);
        store.create(&m).await.unwrap();
        store
            .transition(m.id, &[MigrationStatus::Pending], MigrationStatus::Cancelled, TransitionUpdate::new())
            .await
            .unwrap();

        for to in [MigrationStatus::Locking, MigrationStatus::Running, MigrationStatus::Failed] {
            assert!(store
                .transition(m.id, &MigrationStatus::NON_TERMINAL, to, TransitionUpdate::new())
                .await
                .is_err());
        }
        assert!(store
            .record_shard_progress(m.id, ShardProgress::pending("s0", 0))
            .await
            .is_err());
        assert!(store.request_cancellation(m.id).await.is_err());

        let after = store.get(m.id).await.unwrap();
        assert_eq!(after.status, MigrationStatus::Cancelled);
        assert!(after.completed_at.is_some());
        assert!(after.shards.is_empty());
    }

    #[tokio::test]
    async fn test_backward_edge_rejected_even_if_expected() {
        let (_, store) = store();
        let m = migration("a", 1);
        store.create(&m).await.unwrap();
        let err = store
            .transition(m.id, &[MigrationStatus::Pending], MigrationStatus::Running, TransitionUpdate::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(store.get(m.id).await.unwrap().status, MigrationStatus::Pending);
    }

    #[tokio::test]
    async fn test_record_shard_progress_upserts() {
        let (_, store) = store();
        let m = migration("a", 1);
        store.create(&m).await.unwrap();

        store.record_shard_progress(m.id, ShardProgress::pending("s0", 1)).await.unwrap();
        store.record_shard_progress(m.id, ShardProgress::pending("s1", 1)).await.unwrap();
        let mut done = ShardProgress::pending("s0", 2);
        done.status = ShardStatus::Succeeded;
        done.attempt_count = 1;
        let updated = store.record_shard_progress(m.id, done).await.unwrap();

        assert_eq!(updated.shards.len(), 2);
        assert_eq!(updated.shard("s0").unwrap().status, ShardStatus::Succeeded);
        assert_eq!(updated.shards[0].shard_id, "s0");
    }

    #[tokio::test]
    async fn test_missing_migration() {
        let (_, store) = store();
        let id = MigrationId::new();
        assert_eq!(store.get(id).await.unwrap_err(), Error::MigrationNotFound(id));
        assert!(store.request_cancellation(id).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_transitions_single_winner() {
        let (_, store) = store();
        let store = Arc::new(store);
        let m = migration("a", 1);
        store.create(&m).await.unwrap();
        let id = m.id;

        let mut tasks = Vec::new();
        for target in [MigrationStatus::Locking, MigrationStatus::Cancelled] {
            for _ in 0..8 {
                let store = store.clone();
                tasks.push(tokio::spawn(async move {
                    store
                        .transition(id, &[MigrationStatus::Pending], target, TransitionUpdate::new())
                        .await
                        .is_ok()
                }));
            }
        }
        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
