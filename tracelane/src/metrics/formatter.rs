//! Report formatting: totals, interval rates, and the human-readable text
//! block the reporter logs.

use std::fmt::Write as _;

use serde::Serialize;

use super::ThreadMetricsSnapshot;

/// Sums across every claimed slot at one sampling instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsTotals {
    pub events_written: u64,
    pub events_dropped: u64,
    pub bytes_written: u64,
    pub bytes_dropped: u64,
    pub ring_swaps: u64,
}

impl MetricsTotals {
    pub fn accumulate(&mut self, snapshot: &ThreadMetricsSnapshot) {
        self.events_written += snapshot.events_written;
        self.events_dropped += snapshot.events_dropped;
        self.bytes_written += snapshot.bytes_written;
        self.bytes_dropped += snapshot.bytes_dropped;
        self.ring_swaps += snapshot.ring_swaps;
    }
}

/// Per-second deltas between two consecutive totals.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricsRates {
    pub events_per_sec: f64,
    pub drops_per_sec: f64,
    pub bytes_per_sec: f64,
}

/// Rates over the window `[previous, current]` spanning `elapsed_ns`.
/// Returns zeros for an empty or inverted window.
#[must_use]
pub fn compute_rates(
    previous: &MetricsTotals,
    current: &MetricsTotals,
    elapsed_ns: u64,
) -> MetricsRates {
    if elapsed_ns == 0 {
        return MetricsRates::default();
    }
    let seconds = elapsed_ns as f64 / 1e9;
    let delta = |cur: u64, prev: u64| cur.saturating_sub(prev) as f64 / seconds;
    MetricsRates {
        events_per_sec: delta(current.events_written, previous.events_written),
        drops_per_sec: delta(current.events_dropped, previous.events_dropped),
        bytes_per_sec: delta(current.bytes_written, previous.bytes_written),
    }
}

/// Scale a byte count into a short human unit.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// One line per thread plus a totals line, for the human report.
#[must_use]
pub fn format_human_report(
    active_threads: u32,
    totals: &MetricsTotals,
    rates: &MetricsRates,
    threads: &[(u32, u64, ThreadMetricsSnapshot)],
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "threads:{active_threads} events:{} dropped:{} data:{} swaps:{} \
         ({:.0} ev/s, {} /s)",
        totals.events_written,
        totals.events_dropped,
        format_bytes(totals.bytes_written),
        totals.ring_swaps,
        rates.events_per_sec,
        format_bytes(rates.bytes_per_sec as u64),
    );
    for (slot_index, thread_id, metrics) in threads {
        let _ = writeln!(
            out,
            "  slot {slot_index} tid {thread_id}: written:{} dropped:{} swaps:{}",
            metrics.events_written, metrics.events_dropped, metrics.ring_swaps,
        );
    }
    out.pop(); // trailing newline
    out
}
