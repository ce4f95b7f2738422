//! Core types used throughout the migration coordinator.
//!
//! A [`Migration`] is a named, versioned unit of schema or data change that
//! targets one logical database spread across N shards. Its per-shard state
//! lives in [`ShardProgress`] records owned by the migration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque key-value map attached to migrations and events.
pub type Metadata = BTreeMap<String, String>;

/// Shard identifier as it appears in the topology.
pub type ShardId = String;

/// Maximum length of a migration name.
pub const MAX_NAME_LEN: usize = 255;

/// Unique, immutable migration identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MigrationId(Uuid);

impl MigrationId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing uuid.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying uuid.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MigrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MigrationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Validation(format!("invalid migration id {:?}: {}", s, e)))
    }
}

/// Kind of database a migration targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// Document store.
    MongoDb,
    /// Relational store.
    PostgreSql,
}

impl DatabaseType {
    /// All supported database types.
    pub const ALL: [DatabaseType; 2] = [DatabaseType::MongoDb, DatabaseType::PostgreSql];

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::MongoDb => "mongodb",
            DatabaseType::PostgreSql => "postgresql",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mongodb" | "mongo" => Ok(DatabaseType::MongoDb),
            "postgresql" | "postgres" => Ok(DatabaseType::PostgreSql),
            other => Err(Error::Validation(format!("unknown database type: {}", other))),
        }
    }
}

/// What the migration changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    /// DDL / index / collection layout changes.
    #[default]
    Schema,
    /// Data backfills and transforms.
    Data,
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationType::Schema => write!(f, "schema"),
            MigrationType::Data => write!(f, "data"),
        }
    }
}

/// Aggregate status of a migration.
///
/// ```text
/// PENDING ──► LOCKING ──► RUNNING ──► SUCCEEDED
///    │           │           ├──────► FAILED
///    │           ├──► FAILED ├──────► PARTIALLY_FAILED
///    ▼           ▼           ▼
/// CANCELLED   CANCELLED   CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    /// Created, waiting for an admission slot.
    Pending,
    /// Admitted, acquiring the migration lock.
    Locking,
    /// Lock held, shards executing.
    Running,
    /// Every shard succeeded.
    Succeeded,
    /// Every shard failed, or the migration failed before running shards.
    Failed,
    /// Some shards succeeded and some failed.
    PartiallyFailed,
    /// Cancelled on request.
    Cancelled,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStatus::Pending => write!(f, "PENDING"),
            MigrationStatus::Locking => write!(f, "LOCKING"),
            MigrationStatus::Running => write!(f, "RUNNING"),
            MigrationStatus::Succeeded => write!(f, "SUCCEEDED"),
            MigrationStatus::Failed => write!(f, "FAILED"),
            MigrationStatus::PartiallyFailed => write!(f, "PARTIALLY_FAILED"),
            MigrationStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl MigrationStatus {
    /// All statuses that can still change.
    pub const NON_TERMINAL: [MigrationStatus; 3] = [
        MigrationStatus::Pending,
        MigrationStatus::Locking,
        MigrationStatus::Running,
    ];

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Succeeded
                | MigrationStatus::Failed
                | MigrationStatus::PartiallyFailed
                | MigrationStatus::Cancelled
        )
    }

    /// Check if the forward edge `self -> to` exists in the state machine.
    pub fn can_transition_to(&self, to: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, to),
            (Pending, Locking)
                | (Pending, Cancelled)
                | (Locking, Running)
                | (Locking, Failed)
                | (Locking, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, PartiallyFailed)
                | (Running, Cancelled)
        )
    }
}

/// Status of a single shard within a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ShardStatus {
    /// Check if the shard reached a final outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ShardStatus::Succeeded | ShardStatus::Failed)
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardStatus::Pending => write!(f, "pending"),
            ShardStatus::Running => write!(f, "running"),
            ShardStatus::Succeeded => write!(f, "succeeded"),
            ShardStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-shard execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardProgress {
    pub shard_id: ShardId,
    pub status: ShardStatus,
    /// Executions attempted so far.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Unix millis of the last update.
    pub updated_at: u64,
}

impl ShardProgress {
    /// A fresh, never-attempted shard.
    pub fn pending(shard_id: impl Into<ShardId>, now_ms: u64) -> Self {
        Self {
            shard_id: shard_id.into(),
            status: ShardStatus::Pending,
            attempt_count: 0,
            last_error: None,
            updated_at: now_ms,
        }
    }
}

/// Reason a migration ended in a failure status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationFailure {
    /// Stable code, e.g. `LOCK_TIMEOUT`, `TIMEOUT`, `SHARD_NOT_FOUND`.
    pub code: String,
    pub message: String,
}

impl MigrationFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a failure record from a coordinator error.
    pub fn from_error(err: &Error) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl fmt::Display for MigrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Persisted migration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub id: MigrationId,
    pub name: String,
    pub version: String,
    pub migration_type: MigrationType,
    pub database_type: DatabaseType,
    /// Logical database the migration targets.
    pub database: String,
    pub status: MigrationStatus,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub error: Option<MigrationFailure>,
    pub metadata: Metadata,
    /// Per-shard progress in topology order.
    pub shards: Vec<ShardProgress>,
    /// 1 for the first submission, incremented by explicit retries.
    pub attempt: u32,
    /// Migration this attempt retries, if any.
    pub retry_of: Option<MigrationId>,
    /// Persisted cancellation request, observed between shard units.
    pub cancel_requested: bool,
    /// Unix millis of the last persisted write.
    pub updated_at: u64,
}

impl Migration {
    /// Create a new pending migration from a validated spec.
    pub fn from_spec(spec: &MigrationSpec, attempt: u32, now_ms: u64) -> Self {
        Self {
            id: MigrationId::new(),
            name: spec.name.clone(),
            version: spec.version.clone(),
            migration_type: spec.migration_type,
            database_type: spec.database_type,
            database: spec.database.clone(),
            status: MigrationStatus::Pending,
            created_at: now_ms,
            started_at: None,
            completed_at: None,
            error: None,
            metadata: spec.metadata.clone(),
            shards: Vec::new(),
            attempt,
            retry_of: spec.retry_of,
            cancel_requested: false,
            updated_at: now_ms,
        }
    }

    /// Lock resource guarding this migration's name.
    pub fn lock_resource(&self) -> String {
        lock_resource_for(&self.name)
    }

    /// Get a shard's progress record.
    pub fn shard(&self, shard_id: &str) -> Option<&ShardProgress> {
        self.shards.iter().find(|s| s.shard_id == shard_id)
    }

    /// Number of shards in the given status.
    pub fn count_shards(&self, status: ShardStatus) -> usize {
        self.shards.iter().filter(|s| s.status == status).count()
    }

    /// Aggregate status derived from per-shard outcomes.
    ///
    /// Returns `None` while any shard is still pending or running, or when
    /// the migration has no shards.
    pub fn aggregate_shard_status(&self) -> Option<MigrationStatus> {
        if self.shards.is_empty() || self.shards.iter().any(|s| !s.status.is_terminal()) {
            return None;
        }
        let failed = self.count_shards(ShardStatus::Failed);
        Some(if failed == 0 {
            MigrationStatus::Succeeded
        } else if failed == self.shards.len() {
            MigrationStatus::Failed
        } else {
            MigrationStatus::PartiallyFailed
        })
    }

    /// Wall time between start and completion.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            _ => None,
        }
    }
}

/// Lock resource key for a migration name.
pub fn lock_resource_for(name: &str) -> String {
    format!("migration:{}", name)
}

/// Request to run a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationSpec {
    pub name: String,
    pub version: String,
    pub migration_type: MigrationType,
    pub database_type: DatabaseType,
    pub database: String,
    pub metadata: Metadata,
    /// Set to resubmit a migration that already reached a terminal status.
    pub retry_of: Option<MigrationId>,
}

impl MigrationSpec {
    /// Create a schema migration spec.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        database_type: DatabaseType,
        database: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            migration_type: MigrationType::Schema,
            database_type,
            database: database.into(),
            metadata: Metadata::new(),
            retry_of: None,
        }
    }

    /// Set the migration type.
    pub fn with_type(mut self, migration_type: MigrationType) -> Self {
        self.migration_type = migration_type;
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Mark this submission as an explicit retry of a prior migration.
    pub fn retry_of(mut self, prior: MigrationId) -> Self {
        self.retry_of = Some(prior);
        self
    }

    /// Check the submission before it is stored.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("name must not be empty".into()));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(Error::Validation(format!(
                "name exceeds {} characters",
                MAX_NAME_LEN
            )));
        }
        if self.name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::Validation(format!(
                "name {:?} contains whitespace or control characters",
                self.name
            )));
        }
        if self.version.trim().is_empty() {
            return Err(Error::Validation("version must not be empty".into()));
        }
        if self.database.trim().is_empty() {
            return Err(Error::Validation("database must not be empty".into()));
        }
        Ok(())
    }
}

/// Filter for listing migrations.
#[derive(Debug, Clone, Default)]
pub struct MigrationFilter {
    pub statuses: Vec<MigrationStatus>,
    pub name: Option<String>,
    pub database_type: Option<DatabaseType>,
    pub limit: Option<usize>,
}

impl MigrationFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only migrations in the given status (may be called repeatedly).
    pub fn with_status(mut self, status: MigrationStatus) -> Self {
        self.statuses.push(status);
        self
    }

    /// Only migrations that can still change.
    pub fn non_terminal() -> Self {
        Self {
            statuses: MigrationStatus::NON_TERMINAL.to_vec(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_database_type(mut self, database_type: DatabaseType) -> Self {
        self.database_type = Some(database_type);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check a migration against the filter (ignores `limit`).
    pub fn matches(&self, migration: &Migration) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&migration.status) {
            return false;
        }
        if let Some(name) = &self.name {
            if &migration.name != name {
                return false;
            }
        }
        if let Some(db) = self.database_type {
            if migration.database_type != db {
                return false;
            }
        }
        true
    }

    /// Filter, sort by creation time and truncate.
    pub fn apply<I>(&self, migrations: I) -> Vec<Migration>
    where
        I: IntoIterator<Item = Migration>,
    {
        let mut out: Vec<Migration> = migrations.into_iter().filter(|m| self.matches(m)).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}
