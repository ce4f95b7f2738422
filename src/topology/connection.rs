//! Database client capability set and the connection registry.
//!
//! The coordinator never talks to a driver directly. Everything it needs
//! from a database, whether a shard or the coordination store, is the
//! [`DatabaseClient`] capability set:
//!
//! ```text
//! ┌───────────────────────────┐        ┌──────────────────────────────┐
//! │    ConnectionRegistry     │──────► │ ClientFactory::connect(uri)  │
//! │  (DatabaseType, uri) ──►  │        └──────────────────────────────┘
//! │     Arc<dyn Client>       │                      │
//! └───────────────────────────┘                      ▼
//!                                    ┌──────────────────────────────┐
//!                                    │        DatabaseClient        │
//!                                    │  ping / read /               │
//!                                    │  write_conditional /         │
//!                                    │  create_index / close        │
//!                                    └──────────────────────────────┘
//! ```
//!
//! Document-store and relational adapters implement the same trait and are
//! selected by [`DatabaseType`]. The registry has an explicit lifecycle: it
//! is created at startup, injected where needed and closed at shutdown.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::DatabaseType;

/// Collection holding migration records.
pub const MIGRATION_STATE: &str = "migration_state";
/// Collection holding audit events.
pub const MIGRATION_EVENTS: &str = "migration_events";
/// Collection holding lock records.
pub const MIGRATION_LOCKS: &str = "migration_locks";

/// A stored value with its per-key version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Bumped on every successful write. Starts at 1.
    pub version: u64,
    pub value: Vec<u8>,
}

/// Precondition for [`DatabaseClient::write_conditional`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Key must not exist.
    Absent,
    /// Key must exist at exactly this version.
    Version(u64),
    /// Unconditional.
    Any,
}

/// Secondary index definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<String>,
    pub unique: bool,
    /// TTL index: documents expire this long after the indexed timestamp.
    pub expire_after: Option<Duration>,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, keys: &[&str]) -> Self {
        Self {
            name: name.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            unique: false,
            expire_after: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.expire_after = Some(ttl);
        self
    }
}

/// Indexes the coordination collections rely on.
pub fn coordination_indexes() -> Vec<(&'static str, IndexSpec)> {
    vec![
        (MIGRATION_STATE, IndexSpec::new("name_version", &["name", "version", "attempt"]).unique()),
        (MIGRATION_STATE, IndexSpec::new("status", &["status"])),
        (MIGRATION_EVENTS, IndexSpec::new("migration_timestamp", &["migration_id", "timestamp"])),
        (MIGRATION_LOCKS, IndexSpec::new("resource", &["resource"]).unique()),
        (
            MIGRATION_LOCKS,
            IndexSpec::new("expires_at_ttl", &["expires_at"]).expire_after(Duration::ZERO),
        ),
    ]
}

/// Create the coordination indexes. Safe to call repeatedly.
pub async fn ensure_coordination_indexes(client: &dyn DatabaseClient) -> Result<()> {
    for (collection, index) in coordination_indexes() {
        client.create_index(collection, &index).await?;
        tracing::debug!(collection, index = %index.name, "Ensured index");
    }
    tracing::info!(database_type = %client.database_type(), "Coordination indexes ready");
    Ok(())
}

/// Capability set the coordinator requires from a database.
#[async_trait]
pub trait DatabaseClient: Send + Sync + std::fmt::Debug {
    /// Which adapter family this client belongs to.
    fn database_type(&self) -> DatabaseType;

    /// Round-trip check that the server is reachable.
    async fn ping(&self) -> Result<()>;

    /// Read one value by key.
    async fn read(&self, collection: &str, key: &str) -> Result<Option<Versioned>>;

    /// Atomically write (or delete, when `value` is `None`) if `condition` holds.
    ///
    /// Returns `Ok(false)` when the precondition did not hold.
    async fn write_conditional(
        &self,
        collection: &str,
        key: &str,
        condition: WriteCondition,
        value: Option<Vec<u8>>,
    ) -> Result<bool>;

    /// Create an index if it does not exist yet.
    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<()>;

    /// Release the underlying connection pool.
    async fn close(&self) -> Result<()>;
}

/// Opens clients for a database type and URI.
#[async_trait]
pub trait ClientFactory: Send + Sync + std::fmt::Debug {
    async fn connect(&self, database_type: DatabaseType, uri: &str) -> Result<Arc<dyn DatabaseClient>>;
}

/// Registry of open clients keyed by database type and URI.
#[derive(Debug)]
pub struct ConnectionRegistry {
    factory: Arc<dyn ClientFactory>,
    clients: DashMap<(DatabaseType, String), Arc<dyn DatabaseClient>>,
    /// Serializes connects so one URI never opens two pools.
    connect_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            clients: DashMap::new(),
            connect_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Return a verified client, connecting on first use.
    ///
    /// New clients are pinged before being cached; a failed ping surfaces
    /// as [`Error::DatabaseConnection`] and nothing is cached.
    pub async fn client(&self, database_type: DatabaseType, uri: &str) -> Result<Arc<dyn DatabaseClient>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::DatabaseConnection("connection registry is closed".into()));
        }
        let key = (database_type, uri.to_string());
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.value().clone());
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.value().clone());
        }

        let client = self.factory.connect(database_type, uri).await.map_err(|e| match e {
            Error::DatabaseConnection(_) => e,
            other => Error::DatabaseConnection(other.to_string()),
        })?;
        if let Err(e) = client.ping().await {
            let _ = client.close().await;
            return Err(match e {
                Error::DatabaseConnection(_) => e,
                other => Error::DatabaseConnection(format!("ping failed: {}", other)),
            });
        }

        tracing::info!(database_type = %database_type, uri = %redact_uri(uri), "Opened database connection");
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    /// Drop a cached client so the next call reconnects.
    pub async fn evict(&self, database_type: DatabaseType, uri: &str) {
        if let Some((_, client)) = self.clients.remove(&(database_type, uri.to_string())) {
            if let Err(e) = client.close().await {
                tracing::warn!(uri = %redact_uri(uri), error = %e, "Failed to close evicted client");
            }
        }
    }

    /// Number of open clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every client. Further `client` calls fail.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let keys: Vec<_> = self.clients.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, client)) = self.clients.remove(&key) {
                if let Err(e) = client.close().await {
                    tracing::warn!(uri = %redact_uri(&key.1), error = %e, "Failed to close client");
                }
            }
        }
        tracing::info!("Connection registry closed");
    }
}

/// Strip credentials from a URI for logging.
pub fn redact_uri(uri: &str) -> String {
    let Some(scheme_end) = uri.find("://") else {
        return uri.to_string();
    };
    let rest = &uri[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***@{}", &uri[..scheme_end], &rest[at + 1..]),
        None => uri.to_string(),
    }
}

// ============================================================================
// In-Memory Implementation (for testing)
// ============================================================================

/// In-memory database with per-key versioned CAS.
#[derive(Debug)]
pub struct InMemoryDatabase {
    database_type: DatabaseType,
    collections: Mutex<HashMap<String, HashMap<String, Versioned>>>,
    indexes: Mutex<HashMap<String, Vec<IndexSpec>>>,
    available: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryDatabase {
    pub fn new(database_type: DatabaseType) -> Self {
        Self {
            database_type,
            collections: Mutex::new(HashMap::new()),
            indexes: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Indexes created on a collection.
    pub fn indexes(&self, collection: &str) -> Vec<IndexSpec> {
        self.indexes.lock().get(collection).cloned().unwrap_or_default()
    }

    /// Keys currently stored in a collection.
    pub fn keys(&self, collection: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .collections
            .lock()
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::DatabaseConnection("client closed".into()));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::DatabaseConnection("server unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseClient for InMemoryDatabase {
    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn read(&self, collection: &str, key: &str) -> Result<Option<Versioned>> {
        self.check()?;
        Ok(self
            .collections
            .lock()
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    async fn write_conditional(
        &self,
        collection: &str,
        key: &str,
        condition: WriteCondition,
        value: Option<Vec<u8>>,
    ) -> Result<bool> {
        self.check()?;
        let mut collections = self.collections.lock();
        let docs = collections.entry(collection.to_string()).or_default();
        let current = docs.get(key).map(|v| v.version);

        let holds = match condition {
            WriteCondition::Absent => current.is_none(),
            WriteCondition::Version(v) => current == Some(v),
            WriteCondition::Any => true,
        };
        if !holds {
            return Ok(false);
        }

        match value {
            Some(value) => {
                let version = current.unwrap_or(0) + 1;
                docs.insert(key.to_string(), Versioned { version, value });
            }
            None => {
                docs.remove(key);
            }
        }
        Ok(true)
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<()> {
        self.check()?;
        let mut indexes = self.indexes.lock();
        let list = indexes.entry(collection.to_string()).or_default();
        if !list.iter().any(|i| i.name == index.name) {
            list.push(index.clone());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out one [`InMemoryDatabase`] per URI.
#[derive(Debug, Default)]
pub struct InMemoryClientFactory {
    databases: DashMap<String, Arc<InMemoryDatabase>>,
    refused: Mutex<HashSet<String>>,
    connects: AtomicUsize,
}

impl InMemoryClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connects to `uri` fail.
    pub fn refuse(&self, uri: impl Into<String>) {
        self.refused.lock().insert(uri.into());
    }

    /// The database behind a URI, if one was ever connected.
    pub fn database(&self, uri: &str) -> Option<Arc<InMemoryDatabase>> {
        self.databases.get(uri).map(|d| d.value().clone())
    }

    /// Total successful connects.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for InMemoryClientFactory {
    async fn connect(&self, database_type: DatabaseType, uri: &str) -> Result<Arc<dyn DatabaseClient>> {
        if self.refused.lock().contains(uri) {
            return Err(Error::DatabaseConnection(format!("connection refused: {}", redact_uri(uri))));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let db = self
            .databases
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(InMemoryDatabase::new(database_type)))
            .value()
            .clone();
        // A previously closed client behaves like a fresh pool on reconnect.
        db.closed.store(false, Ordering::SeqCst);
        Ok(db)
    }
}
