//! Scripted shard executor for driving orchestrator scenarios.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::engine::{ShardExecutor, ShardTask};
use crate::error::{Error, Result};
use crate::types::{MigrationId, ShardId};

#[derive(Debug, Clone)]
enum Script {
    FailAlways(Error),
    FailTimes { remaining: u32, error: Error },
}

/// One recorded `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardCall {
    pub migration_id: MigrationId,
    pub shard_id: ShardId,
    pub attempt: u32,
}

/// Blocks a shard's execution until opened.
///
/// `wait_entered` returns once per execution that reached the gate, so a
/// test knows the shard is in flight before it acts.
#[derive(Debug)]
pub struct ShardGate {
    entered: Semaphore,
    released: Semaphore,
}

impl ShardGate {
    fn new() -> Self {
        Self {
            entered: Semaphore::new(0),
            released: Semaphore::new(0),
        }
    }

    async fn pass(&self) {
        self.entered.add_permits(1);
        // A closed semaphore lets everyone through.
        if let Ok(permit) = self.released.acquire().await {
            permit.forget();
        }
    }

    /// Wait until an execution is parked at the gate.
    pub async fn wait_entered(&self) {
        if let Ok(permit) = self.entered.acquire().await {
            permit.forget();
        }
    }

    /// Let every current and future execution through.
    pub fn open(&self) {
        self.released.close();
    }
}

/// Executor whose per-shard behaviour is scripted by the test.
///
/// Shards without a script succeed after pinging their client. Scripts are
/// keyed by shard id only, so use distinct shard ids across migrations that
/// need different behaviour.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<ShardId, Script>>,
    gates: Mutex<HashMap<ShardId, Arc<ShardGate>>>,
    calls: Mutex<Vec<ShardCall>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every execution of `shard_id` fails with `error`.
    pub fn fail_always(&self, shard_id: impl Into<ShardId>, error: Error) -> &Self {
        self.scripts.lock().insert(shard_id.into(), Script::FailAlways(error));
        self
    }

    /// The next `times` executions of `shard_id` fail with `error`.
    pub fn fail_times(&self, shard_id: impl Into<ShardId>, times: u32, error: Error) -> &Self {
        self.scripts.lock().insert(
            shard_id.into(),
            Script::FailTimes {
                remaining: times,
                error,
            },
        );
        self
    }

    /// Hold executions of `shard_id` until the returned gate is opened.
    pub fn gate(&self, shard_id: impl Into<ShardId>) -> Arc<ShardGate> {
        self.gates
            .lock()
            .entry(shard_id.into())
            .or_insert_with(|| Arc::new(ShardGate::new()))
            .clone()
    }

    /// Sleep this long in every execution.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// All executions so far, in call order.
    pub fn calls(&self) -> Vec<ShardCall> {
        self.calls.lock().clone()
    }

    /// Executions of one shard.
    pub fn attempts(&self, shard_id: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.shard_id == shard_id).count()
    }

    fn scripted_failure(&self, shard_id: &str) -> Option<Error> {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(shard_id) {
            Some(Script::FailAlways(error)) => Some(error.clone()),
            Some(Script::FailTimes { remaining, error }) if *remaining > 0 => {
                *remaining -= 1;
                Some(error.clone())
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ShardExecutor for ScriptedExecutor {
    async fn execute(&self, task: &ShardTask) -> Result<()> {
        self.calls.lock().push(ShardCall {
            migration_id: task.migration_id,
            shard_id: task.shard_id.clone(),
            attempt: task.attempt,
        });

        let gate = self.gates.lock().get(&task.shard_id).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.scripted_failure(&task.shard_id) {
            Some(error) => Err(error),
            None => task.client.ping().await,
        }
    }
}
