//! Cross-worker coordination primitives.
//!
//! Workers never talk to each other. Everything they agree on goes through
//! these components:
//!
//! ```text
//! ┌──────────────────┐  CAS on status   ┌──────────────────────┐
//! │  Orchestrator A  │ ───────────────► │  MigrationStateStore │
//! │  Orchestrator B  │                  └──────────────────────┘
//! │       ...        │  acquire/renew   ┌──────────────────────┐
//! │                  │ ───────────────► │  LockManager         │
//! │                  │  (fenced)        └──────────────────────┘
//! │                  │  append          ┌──────────────────────┐
//! │                  │ ───────────────► │  EventLog            │
//! └──────────────────┘                  └──────────────────────┘
//!          │ local only
//!          ▼
//! ┌──────────────────────────────────────────────┐
//! │ AdmissionController (slots + throttle)       │
//! └──────────────────────────────────────────────┘
//! ```

pub mod admission;
pub mod event_log;
pub mod file_store;
pub mod lock;
pub mod rate_limiter;
pub mod state_store;

pub use admission::{AdmissionController, SlotGuard, SlotPool};
pub use event_log::{EventLog, EventLogConfig, EventStore, EventType, InMemoryEventStore, MigrationEvent};
pub use file_store::FileMigrationStore;
pub use lock::{InMemoryLockManager, LockHandle, LockKeeper, LockManager, MigrationLock, StoreLockManager};
pub use rate_limiter::{ShardThrottle, TokenBucketRateLimiter};
pub use state_store::{InMemoryMigrationStore, MigrationStateStore, TransitionUpdate};
