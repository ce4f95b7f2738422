//! Testing utilities for the migration coordinator.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       TestHarness                        │
//! │                                                          │
//! │  MigrationOrchestrator ──► ScriptedExecutor (gates,      │
//! │        │                   scripted failures, call log)  │
//! │        ├──► InMemoryMigrationStore                       │
//! │        ├──► InMemoryLockManager   ◄── ManualClock        │
//! │        ├──► InMemoryEventStore                           │
//! │        └──► ConnectionRegistry ──► InMemoryClientFactory │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use migration_coordinator::testing::{mongo_topology, test_config, wait_for_terminal, TestHarness};
//!
//! let h = TestHarness::new(test_config(), mongo_topology("orders", "ord-", 3))?;
//! h.executor.fail_always("ord-1", Error::DatabaseQuery("boom".into()));
//! let gate = h.executor.gate("ord-0");
//!
//! let id = h.submit("add_index", "orders").await?;
//! gate.wait_entered().await;   // ord-0 is in flight
//! h.clock.advance(Duration::from_secs(120));
//! gate.open();
//!
//! let done = wait_for_terminal(&h.orchestrator, id, Duration::from_secs(5)).await;
//! ```

mod executor;
mod utils;

mod orchestrator_e2e_tests;

pub use executor::{ScriptedExecutor, ShardCall, ShardGate};
pub use utils::{
    mongo_topology, test_config, wait_for_result, wait_for_status, wait_for_terminal, TestHarness, TEST_EPOCH_MS,
};
