//! Monotonic session counters.
//!
//! All counters are relaxed atomics: they never synchronize anything, they
//! are only read by inspectors (the status snapshot and the reporter).

pub mod formatter;
pub mod reporter;

use std::sync::atomic::{AtomicU64, Ordering};

use tracelane_common::MAX_THREADS;

pub use formatter::{compute_rates, format_bytes, MetricsRates, MetricsTotals};
pub use reporter::{MetricsReporter, ReporterConfig};

/// Per-producer-thread counters, owned by the thread's registry slot.
#[derive(Debug, Default)]
pub struct ThreadMetrics {
    pub events_written: AtomicU64,
    pub events_dropped: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_dropped: AtomicU64,
    pub ring_swaps: AtomicU64,
    /// Nanoseconds spent in first-touch registration.
    pub registration_ns: AtomicU64,
}

impl ThreadMetrics {
    pub fn record_write(&self, bytes: u64) {
        self.events_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_drop(&self, bytes: u64) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
        self.bytes_dropped.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_swap(&self) {
        self.ring_swaps.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ThreadMetricsSnapshot {
        ThreadMetricsSnapshot {
            events_written: self.events_written.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            ring_swaps: self.ring_swaps.load(Ordering::Relaxed),
            registration_ns: self.registration_ns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ThreadMetricsSnapshot {
    pub events_written: u64,
    pub events_dropped: u64,
    pub bytes_written: u64,
    pub bytes_dropped: u64,
    pub ring_swaps: u64,
    pub registration_ns: u64,
}

/// Counters owned by the drain worker.
#[derive(Debug)]
pub struct DrainMetrics {
    pub cycles_total: AtomicU64,
    pub cycles_idle: AtomicU64,
    pub rings_total: AtomicU64,
    pub rings_index: AtomicU64,
    pub rings_detail: AtomicU64,
    pub fairness_switches: AtomicU64,
    pub sleeps: AtomicU64,
    pub yields: AtomicU64,
    pub final_drains: AtomicU64,
    pub total_sleep_us: AtomicU64,
    pub write_errors: AtomicU64,
    /// Rings drained per slot, `[index, detail]`.
    per_thread_rings: Box<[[AtomicU64; 2]]>,
}

impl Default for DrainMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainMetrics {
    #[must_use]
    pub fn new() -> Self {
        let per_thread = (0..MAX_THREADS)
            .map(|_| [AtomicU64::new(0), AtomicU64::new(0)])
            .collect::<Vec<_>>();
        Self {
            cycles_total: AtomicU64::new(0),
            cycles_idle: AtomicU64::new(0),
            rings_total: AtomicU64::new(0),
            rings_index: AtomicU64::new(0),
            rings_detail: AtomicU64::new(0),
            fairness_switches: AtomicU64::new(0),
            sleeps: AtomicU64::new(0),
            yields: AtomicU64::new(0),
            final_drains: AtomicU64::new(0),
            total_sleep_us: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            per_thread_rings: per_thread.into_boxed_slice(),
        }
    }

    pub fn record_rings(&self, slot_index: usize, detail: bool, count: u64) {
        self.rings_total.fetch_add(count, Ordering::Relaxed);
        if detail {
            self.rings_detail.fetch_add(count, Ordering::Relaxed);
        } else {
            self.rings_index.fetch_add(count, Ordering::Relaxed);
        }
        if slot_index < self.per_thread_rings.len() {
            self.per_thread_rings[slot_index][usize::from(detail)]
                .fetch_add(count, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> DrainMetricsSnapshot {
        DrainMetricsSnapshot {
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            cycles_idle: self.cycles_idle.load(Ordering::Relaxed),
            rings_total: self.rings_total.load(Ordering::Relaxed),
            rings_index: self.rings_index.load(Ordering::Relaxed),
            rings_detail: self.rings_detail.load(Ordering::Relaxed),
            fairness_switches: self.fairness_switches.load(Ordering::Relaxed),
            sleeps: self.sleeps.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            final_drains: self.final_drains.load(Ordering::Relaxed),
            total_sleep_us: self.total_sleep_us.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            rings_per_thread: self
                .per_thread_rings
                .iter()
                .map(|pair| {
                    [
                        pair[0].load(Ordering::Relaxed),
                        pair[1].load(Ordering::Relaxed),
                    ]
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DrainMetricsSnapshot {
    pub cycles_total: u64,
    pub cycles_idle: u64,
    pub rings_total: u64,
    pub rings_index: u64,
    pub rings_detail: u64,
    pub fairness_switches: u64,
    pub sleeps: u64,
    pub yields: u64,
    pub final_drains: u64,
    pub total_sleep_us: u64,
    pub write_errors: u64,
    pub rings_per_thread: Vec<[u64; 2]>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_metrics_accumulate() {
        let m = ThreadMetrics::default();
        m.record_write(32);
        m.record_write(32);
        m.record_drop(32);
        m.record_swap();
        let snap = m.snapshot();
        assert_eq!(snap.events_written, 2);
        assert_eq!(snap.bytes_written, 64);
        assert_eq!(snap.events_dropped, 1);
        assert_eq!(snap.ring_swaps, 1);
    }

    #[test]
    fn drain_metrics_split_by_lane() {
        let m = DrainMetrics::new();
        m.record_rings(3, false, 2);
        m.record_rings(3, true, 1);
        let snap = m.snapshot();
        assert_eq!(snap.rings_total, 3);
        assert_eq!(snap.rings_index, 2);
        assert_eq!(snap.rings_detail, 1);
        assert_eq!(snap.rings_per_thread[3], [2, 1]);
    }
}
