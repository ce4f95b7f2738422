//! Duration histograms.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::Desc;

/// Bucket boundaries (seconds) for whole-migration durations.
pub const MIGRATION_DURATION_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0,
];

/// Bucket boundaries (seconds) for single shard executions.
pub const SHARD_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 60.0,
];

/// Distribution of durations over fixed boundaries.
///
/// Each observation lands in exactly one slot; cumulative counts are built
/// when reading. The sum is kept in whole microseconds so no float CAS is
/// needed on the hot path.
#[derive(Debug)]
pub struct Histogram {
    desc: Desc,
    bounds: &'static [f64],
    /// One per bound, plus the overflow slot.
    slots: Vec<AtomicU64>,
    sum_micros: AtomicU64,
}

impl Histogram {
    /// `bounds` must be ascending.
    pub fn new(name: &'static str, help: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            desc: Desc { name, help },
            bounds,
            slots: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let secs = duration.as_secs_f64();
        let slot = self.bounds.partition_point(|&upper| upper < secs);
        self.slots[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut running = 0;
        let mut cumulative = Vec::with_capacity(self.bounds.len());
        for slot in &self.slots[..self.bounds.len()] {
            running += slot.load(Ordering::Relaxed);
            cumulative.push(running);
        }
        let count = running + self.slots[self.bounds.len()].load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets: self.bounds.to_vec(),
            bucket_counts: cumulative,
            sum: self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            count,
        }
    }

    pub(super) fn render(&self, out: &mut String) {
        let snap = self.snapshot();
        let name = self.desc.name;
        self.desc.header(out, "histogram");
        for (upper, count) in snap.buckets.iter().zip(&snap.bucket_counts) {
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", name, upper, count);
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, snap.count);
        let _ = writeln!(out, "{}_sum {}", name, snap.sum);
        let _ = writeln!(out, "{}_count {}", name, snap.count);
    }
}

/// Point-in-time copy of a histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// Upper bounds in seconds.
    pub buckets: Vec<f64>,
    /// Observations `<=` each bound.
    pub bucket_counts: Vec<u64>,
    /// Seconds.
    pub sum: f64,
    pub count: u64,
}
