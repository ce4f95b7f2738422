//! Monotonic counters.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{slot, Desc};
use crate::types::DatabaseType;

/// Events since the process started.
#[derive(Debug)]
pub struct Counter {
    desc: Desc,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Desc { name, help },
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub(super) fn render(&self, out: &mut String) {
        self.desc.header(out, "counter");
        let _ = writeln!(out, "{} {}", self.desc.name, self.get());
    }
}

/// Counter split by the shard's database type.
///
/// Every type is always rendered, zeros included, so dashboards never see a
/// series appear out of nowhere.
#[derive(Debug)]
pub struct DatabaseCounter {
    desc: Desc,
    values: [AtomicU64; 2],
}

impl DatabaseCounter {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Desc { name, help },
            values: Default::default(),
        }
    }

    pub fn inc(&self, database_type: DatabaseType) {
        self.values[slot(database_type)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, database_type: DatabaseType) -> u64 {
        self.values[slot(database_type)].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        DatabaseType::ALL.iter().map(|&t| self.get(t)).sum()
    }

    pub(super) fn render(&self, out: &mut String) {
        self.desc.header(out, "counter");
        for database_type in DatabaseType::ALL {
            let _ = writeln!(
                out,
                "{}{{database_type=\"{}\"}} {}",
                self.desc.name,
                database_type,
                self.get(database_type)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_counter_keeps_types_apart() {
        let counter = DatabaseCounter::new("shard_attempts_total", "Shard attempts");
        counter.inc(DatabaseType::PostgreSql);
        counter.inc(DatabaseType::PostgreSql);
        counter.inc(DatabaseType::MongoDb);

        assert_eq!(counter.get(DatabaseType::PostgreSql), 2);
        assert_eq!(counter.get(DatabaseType::MongoDb), 1);
        assert_eq!(counter.total(), 3);

        let mut out = String::new();
        counter.render(&mut out);
        assert!(out.contains("shard_attempts_total{database_type=\"postgresql\"} 2\n"));
        assert!(out.contains("# TYPE shard_attempts_total counter\n"));
    }

    #[test]
    fn test_untouched_types_render_as_zero() {
        let counter = DatabaseCounter::new("shard_failures_total", "Shard failures");
        counter.inc(DatabaseType::MongoDb);

        let mut out = String::new();
        counter.render(&mut out);
        assert!(out.contains("shard_failures_total{database_type=\"mongodb\"} 1\n"));
        assert!(out.contains("shard_failures_total{database_type=\"postgresql\"} 0\n"));
    }
}
