//! Coordinator metrics.
//!
//! Prometheus-style counters, gauges and histograms built on atomics:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CoordinatorMetrics                       │
//! │  ┌────────────────┐  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  Counters      │  │   Gauges     │  │   Histograms    │  │
//! │  │ - submitted    │  │ - active     │  │ - migration     │  │
//! │  │ - terminal by  │  │ - queued     │  │   duration      │  │
//! │  │   status       │  │ - shards     │  │ - shard         │  │
//! │  │ - shard tries* │  │   running*   │  │   duration      │  │
//! │  │ - lock contend │  │              │  │                 │  │
//! │  └────────────────┘  └──────────────┘  └─────────────────┘  │
//! │                          * one series per database type     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::{Counter, DatabaseCounter};
pub use gauges::{DatabaseGauge, Gauge, GaugeGuard};
pub use histograms::{Histogram, HistogramSnapshot, MIGRATION_DURATION_BUCKETS, SHARD_DURATION_BUCKETS};

use std::fmt::Write as _;
use std::time::Duration;

use crate::types::{DatabaseType, MigrationStatus};

/// Name and help text of one metric family.
#[derive(Debug, Clone, Copy)]
struct Desc {
    name: &'static str,
    help: &'static str,
}

impl Desc {
    fn header(&self, out: &mut String, kind: &str) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} {}", self.name, kind);
    }
}

/// Index of a database type in per-type series.
fn slot(database_type: DatabaseType) -> usize {
    match database_type {
        DatabaseType::MongoDb => 0,
        DatabaseType::PostgreSql => 1,
    }
}

/// All coordinator metrics.
#[derive(Debug)]
pub struct CoordinatorMetrics {
    // Lifecycle counters
    pub submitted: Counter,
    pub started: Counter,
    pub succeeded: Counter,
    pub failed: Counter,
    pub partially_failed: Counter,
    pub cancelled: Counter,

    // Shard series
    pub shard_attempts: DatabaseCounter,
    /// Shards that ended failed after their last attempt.
    pub shard_failures: DatabaseCounter,
    /// Shard tasks currently executing, retries included.
    pub shards_running: DatabaseGauge,

    /// LockHeld answers while acquiring a migration lock.
    pub lock_contention: Counter,

    /// Migrations holding an admission slot.
    pub active: Gauge,
    /// Migrations waiting for a slot.
    pub queued: Gauge,

    pub migration_duration: Histogram,
    pub shard_duration: Histogram,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self {
            submitted: Counter::new("migrations_submitted_total", "Migrations accepted for execution"),
            started: Counter::new("migrations_started_total", "Migrations that reached RUNNING"),
            succeeded: Counter::new("migrations_succeeded_total", "Migrations ending SUCCEEDED"),
            failed: Counter::new("migrations_failed_total", "Migrations ending FAILED"),
            partially_failed: Counter::new(
                "migrations_partially_failed_total",
                "Migrations ending PARTIALLY_FAILED",
            ),
            cancelled: Counter::new("migrations_cancelled_total", "Migrations ending CANCELLED"),
            shard_attempts: DatabaseCounter::new("shard_attempts_total", "Shard execution attempts"),
            shard_failures: DatabaseCounter::new("shard_failures_total", "Shards that exhausted their attempts"),
            shards_running: DatabaseGauge::new("shards_running", "Shard tasks currently executing"),
            lock_contention: Counter::new("lock_contention_total", "Lock acquisitions refused as held"),
            active: Gauge::new("migrations_active", "Migrations holding an admission slot"),
            queued: Gauge::new("migrations_queued", "Migrations waiting for an admission slot"),
            migration_duration: Histogram::new(
                "migration_duration_seconds",
                "Migration duration from start to terminal status",
                MIGRATION_DURATION_BUCKETS,
            ),
            shard_duration: Histogram::new(
                "shard_duration_seconds",
                "Single shard execution duration",
                SHARD_DURATION_BUCKETS,
            ),
        }
    }

    /// Record a migration reaching a terminal status.
    pub fn record_terminal(&self, status: MigrationStatus, duration: Option<Duration>) {
        match status {
            MigrationStatus::Succeeded => self.succeeded.inc(),
            MigrationStatus::Failed => self.failed.inc(),
            MigrationStatus::PartiallyFailed => self.partially_failed.inc(),
            MigrationStatus::Cancelled => self.cancelled.inc(),
            _ => return,
        }
        if let Some(duration) = duration {
            self.migration_duration.observe(duration);
        }
    }

    /// Record one shard execution attempt.
    pub fn record_shard_attempt(&self, database_type: DatabaseType, duration: Duration) {
        self.shard_attempts.inc(database_type);
        self.shard_duration.observe(duration);
    }

    pub fn record_shard_failure(&self, database_type: DatabaseType) {
        self.shard_failures.inc(database_type);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.get(),
            started: self.started.get(),
            succeeded: self.succeeded.get(),
            failed: self.failed.get(),
            partially_failed: self.partially_failed.get(),
            cancelled: self.cancelled.get(),
            shard_attempts: self.shard_attempts.total(),
            shard_failures: self.shard_failures.total(),
            shards_running: self.shards_running.total(),
            lock_contention: self.lock_contention.get(),
            active: self.active.get(),
            queued: self.queued.get(),
            migration_duration: self.migration_duration.snapshot(),
        }
    }

    /// Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for counter in [
            &self.submitted,
            &self.started,
            &self.succeeded,
            &self.failed,
            &self.partially_failed,
            &self.cancelled,
            &self.lock_contention,
        ] {
            counter.render(&mut out);
        }
        self.shard_attempts.render(&mut out);
        self.shard_failures.render(&mut out);
        self.shards_running.render(&mut out);
        self.active.render(&mut out);
        self.queued.render(&mut out);
        self.migration_duration.render(&mut out);
        self.shard_duration.render(&mut out);
        out
    }
}

impl Default for CoordinatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the coordinator metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub partially_failed: u64,
    pub cancelled: u64,
    pub shard_attempts: u64,
    pub shard_failures: u64,
    pub shards_running: i64,
    pub lock_contention: u64,
    pub active: i64,
    pub queued: i64,
    pub migration_duration: HistogramSnapshot,
}

impl MetricsSnapshot {
    /// Migrations that reached any terminal status.
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed + self.partially_failed + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_terminal() {
        let metrics = CoordinatorMetrics::new();
        metrics.record_terminal(MigrationStatus::Succeeded, Some(Duration::from_secs(2)));
        metrics.record_terminal(MigrationStatus::PartiallyFailed, None);
        metrics.record_terminal(MigrationStatus::Running, Some(Duration::from_secs(1)));

        let snap = metrics.snapshot();
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.partially_failed, 1);
        assert_eq!(snap.completed(), 2);
        assert_eq!(snap.migration_duration.count, 1);
    }

    #[test]
    fn test_shard_series_by_database_type() {
        let metrics = CoordinatorMetrics::new();
        metrics.record_shard_attempt(DatabaseType::PostgreSql, Duration::from_millis(10));
        metrics.record_shard_attempt(DatabaseType::PostgreSql, Duration::from_millis(10));
        metrics.record_shard_attempt(DatabaseType::MongoDb, Duration::from_millis(10));
        metrics.record_shard_failure(DatabaseType::MongoDb);
        let running = metrics.shards_running.track(DatabaseType::MongoDb);

        let snap = metrics.snapshot();
        assert_eq!(metrics.shard_attempts.get(DatabaseType::PostgreSql), 2);
        assert_eq!(snap.shard_attempts, 3);
        assert_eq!(snap.shard_failures, 1);
        assert_eq!(snap.shards_running, 1);
        drop(running);
        assert_eq!(metrics.snapshot().shards_running, 0);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = CoordinatorMetrics::new();
        metrics.submitted.inc();
        metrics.active.set(3);
        metrics.record_shard_attempt(DatabaseType::MongoDb, Duration::from_millis(20));

        let output = metrics.render_prometheus();
        assert!(output.contains("# TYPE migrations_submitted_total counter\nmigrations_submitted_total 1\n"));
        assert!(output.contains("migrations_active 3\n"));
        assert!(output.contains("shard_attempts_total{database_type=\"mongodb\"} 1\n"));
        assert!(output.contains("shards_running{database_type=\"postgresql\"} 0\n"));
        assert!(output.contains("shard_duration_seconds_count 1\n"));
    }
}
