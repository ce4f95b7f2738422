//! Append-only migration audit log.
//!
//! [`EventLog`] wraps an [`EventStore`] and never fails the caller: migration
//! progress must not block on audit writes. A failed append is retried a few
//! times locally and then parked in a bounded pending buffer that is flushed
//! ahead of the next append. Only when the buffer overflows are events
//! dropped, and every drop is counted and logged.
//!
//! Timestamps are clamped per migration so a migration's events never go
//! backwards, even if the wall clock does. The clamp is dropped once the
//! migration's terminal transition is stamped. Ties are broken by a
//! log-assigned sequence number.
//!
//! Many workers may share one [`EventStore`]. Sequence numbers are only
//! ordered within one log; every event also carries a random `event_id`
//! that identifies it across workers.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::types::{Metadata, MigrationId, MigrationStatus, ShardId};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Submitted,
    /// Exactly one per persisted status transition.
    StatusChanged,
    LockAcquired,
    LockContended,
    LockReleased,
    LockReleaseFailed,
    LockLost,
    ShardsResolved,
    ShardStarted,
    ShardRetrying,
    ShardSucceeded,
    ShardFailed,
    ShardSkipped,
    CancelRequested,
    Recovered,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Submitted => "submitted",
            EventType::StatusChanged => "status_changed",
            EventType::LockAcquired => "lock_acquired",
            EventType::LockContended => "lock_contended",
            EventType::LockReleased => "lock_released",
            EventType::LockReleaseFailed => "lock_release_failed",
            EventType::LockLost => "lock_lost",
            EventType::ShardsResolved => "shards_resolved",
            EventType::ShardStarted => "shard_started",
            EventType::ShardRetrying => "shard_retrying",
            EventType::ShardSucceeded => "shard_succeeded",
            EventType::ShardFailed => "shard_failed",
            EventType::ShardSkipped => "shard_skipped",
            EventType::CancelRequested => "cancel_requested",
            EventType::Recovered => "recovered",
        };
        f.write_str(s)
    }
}

/// Immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationEvent {
    /// Unique across workers, assigned by the log on append.
    pub event_id: Uuid,
    /// Append order within one log.
    pub sequence: u64,
    pub migration_id: MigrationId,
    pub shard_id: Option<ShardId>,
    pub event_type: EventType,
    /// Unix millis, assigned by the log on append.
    pub timestamp: u64,
    pub payload: Metadata,
}

impl MigrationEvent {
    pub fn new(migration_id: MigrationId, event_type: EventType) -> Self {
        Self {
            event_id: Uuid::nil(),
            sequence: 0,
            migration_id,
            shard_id: None,
            event_type,
            timestamp: 0,
            payload: Metadata::new(),
        }
    }

    /// Event recording a persisted status transition.
    pub fn status_changed(migration_id: MigrationId, from: MigrationStatus, to: MigrationStatus) -> Self {
        Self::new(migration_id, EventType::StatusChanged)
            .with("from", from.to_string())
            .with("to", to.to_string())
    }

    pub fn shard(mut self, shard_id: impl Into<ShardId>) -> Self {
        self.shard_id = Some(shard_id.into());
        self
    }

    /// Add a payload entry.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.payload.insert(key.into(), value.to_string());
        self
    }

    /// Payload value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }

    /// Whether this event records a move into a terminal status.
    pub fn is_terminal_transition(&self) -> bool {
        self.event_type == EventType::StatusChanged
            && self
                .get("to")
                .is_some_and(|to| !MigrationStatus::NON_TERMINAL.iter().any(|s| s.to_string() == to))
    }
}

/// Backing store for events.
#[async_trait]
pub trait EventStore: Send + Sync + std::fmt::Debug {
    async fn append(&self, event: &MigrationEvent) -> Result<()>;

    /// All events for a migration, in any order.
    async fn query(&self, migration_id: MigrationId) -> Result<Vec<MigrationEvent>>;
}

/// In-memory event store with failure injection.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<MigrationId, Vec<MigrationEvent>>>,
    fail_appends: AtomicUsize,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` appends.
    pub fn fail_next_appends(&self, n: usize) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    /// Total stored events.
    pub fn len(&self) -> usize {
        self.events.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: &MigrationEvent) -> Result<()> {
        let should_fail = self
            .fail_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(Error::DatabaseConnection("event store unavailable".into()));
        }
        self.events
            .write()
            .entry(event.migration_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn query(&self, migration_id: MigrationId) -> Result<Vec<MigrationEvent>> {
        Ok(self.events.read().get(&migration_id).cloned().unwrap_or_default())
    }
}

/// Tuning for [`EventLog`].
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Immediate attempts per append before parking the event.
    pub append_attempts: u32,
    /// Pause between immediate attempts.
    pub retry_delay: Duration,
    /// Parked events kept before the oldest is dropped.
    pub max_pending: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            append_attempts: 3,
            retry_delay: Duration::from_millis(10),
            max_pending: 10_000,
        }
    }
}

/// Best-effort, ordered event log.
#[derive(Debug)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    config: EventLogConfig,
    /// Sequence counter and last timestamp per migration, stamped together.
    stamps: Mutex<Stamps>,
    pending: Mutex<VecDeque<MigrationEvent>>,
    dropped: AtomicU64,
}

#[derive(Debug, Default)]
struct Stamps {
    next_sequence: u64,
    last_timestamp: HashMap<MigrationId, u64>,
}

impl EventLog {
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(store, clock, EventLogConfig::default())
    }

    pub fn with_config(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>, config: EventLogConfig) -> Self {
        Self {
            store,
            clock,
            config,
            stamps: Mutex::new(Stamps::default()),
            pending: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append an event. Never fails.
    ///
    /// Returns the stamped event.
    pub async fn append(&self, mut event: MigrationEvent) -> MigrationEvent {
        {
            let mut stamps = self.stamps.lock();
            stamps.next_sequence += 1;
            event.sequence = stamps.next_sequence;
            event.event_id = Uuid::new_v4();
            let now = self.clock.now_ms();
            if event.is_terminal_transition() {
                let last = stamps.last_timestamp.remove(&event.migration_id).unwrap_or(0);
                event.timestamp = now.max(last);
            } else {
                let last = stamps.last_timestamp.entry(event.migration_id).or_insert(0);
                event.timestamp = now.max(*last);
                *last = event.timestamp;
            }
        }

        self.flush().await;

        let mut last_error = None;
        for attempt in 0..self.config.append_attempts.max(1) {
            match self.store.append(&event).await {
                Ok(()) => return event,
                Err(e) => {
                    last_error = Some(e);
                    if attempt + 1 < self.config.append_attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        tracing::warn!(
            migration_id = %event.migration_id,
            event_type = %event.event_type,
            error = %last_error.map(|e| e.to_string()).unwrap_or_default(),
            "Event append failed, parking for later flush"
        );
        self.park(event.clone());
        event
    }

    fn park(&self, event: MigrationEvent) {
        let mut pending = self.pending.lock();
        if pending.len() >= self.config.max_pending {
            if let Some(dropped) = pending.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    migration_id = %dropped.migration_id,
                    event_type = %dropped.event_type,
                    sequence = dropped.sequence,
                    "Event buffer full, dropping oldest event"
                );
            }
        }
        pending.push_back(event);
    }

    /// Try to write parked events. Returns how many remain parked.
    pub async fn flush(&self) -> usize {
        loop {
            let Some(event) = self.pending.lock().pop_front() else {
                return 0;
            };
            if let Err(e) = self.store.append(&event).await {
                tracing::debug!(error = %e, "Event flush deferred");
                let mut pending = self.pending.lock();
                pending.push_front(event);
                return pending.len();
            }
        }
    }

    /// Events for a migration ordered by timestamp, then sequence.
    ///
    /// Parked events are included so readers see a complete history. A
    /// parked event the store already holds is listed once.
    pub async fn query(&self, migration_id: MigrationId) -> Result<Vec<MigrationEvent>> {
        self.flush().await;
        let mut events = self.store.query(migration_id).await?;
        let stored: HashSet<Uuid> = events.iter().map(|e| e.event_id).collect();
        events.extend(
            self.pending
                .lock()
                .iter()
                .filter(|e| e.migration_id == migration_id && !stored.contains(&e.event_id))
                .cloned(),
        );
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.sequence.cmp(&b.sequence))
                .then(a.event_id.cmp(&b.event_id))
        });
        Ok(events)
    }

    /// Events currently parked.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Events lost to buffer overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
