//! Gauges.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{slot, Desc};
use crate::types::DatabaseType;

/// Level sampled from elsewhere (queue length, admitted migrations).
#[derive(Debug)]
pub struct Gauge {
    desc: Desc,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Desc { name, help },
            value: AtomicI64::new(0),
        }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub(super) fn render(&self, out: &mut String) {
        self.desc.header(out, "gauge");
        let _ = writeln!(out, "{} {}", self.desc.name, self.get());
    }
}

/// Work in progress per database type, counted by RAII guards.
#[derive(Debug)]
pub struct DatabaseGauge {
    desc: Desc,
    values: [AtomicI64; 2],
}

impl DatabaseGauge {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Desc { name, help },
            values: Default::default(),
        }
    }

    /// Count one unit until the guard drops.
    pub fn track(&self, database_type: DatabaseType) -> GaugeGuard<'_> {
        let value = &self.values[slot(database_type)];
        value.fetch_add(1, Ordering::Relaxed);
        GaugeGuard { value }
    }

    pub fn get(&self, database_type: DatabaseType) -> i64 {
        self.values[slot(database_type)].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> i64 {
        DatabaseType::ALL.iter().map(|&t| self.get(t)).sum()
    }

    pub(super) fn render(&self, out: &mut String) {
        self.desc.header(out, "gauge");
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

/// Decrements its [`DatabaseGauge`] series on drop.
#[derive(Debug)]
pub struct GaugeGuard<'a> {
    value: &'a AtomicI64,
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }
}
