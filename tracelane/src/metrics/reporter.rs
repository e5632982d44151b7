//! # Periodic metrics reporter
//!
//! An optional thread owned by the session that samples the registry's
//! counters on an interval and emits a human-readable line via `log` plus,
//! when configured, one JSON object per report appended to a file.
//!
//! The reporter is a pure observer: it reads counters and backpressure
//! snapshots and never writes core state. It waits on a command channel
//! with a timeout, so pause/resume/force/stop take effect immediately.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{info, warn};
use serde::Serialize;

use crate::clock::monotonic_now_ns;
use crate::domain::LaneKind;
use crate::session::SessionInner;

use super::formatter::{compute_rates, format_human_report, MetricsRates, MetricsTotals};
use super::ThreadMetricsSnapshot;

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Interval between periodic reports.
    pub interval_ms: u64,
    /// Append one JSON object per report to this file.
    pub json_path: Option<PathBuf>,
    /// Start without emitting periodic reports until resumed.
    pub start_paused: bool,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            json_path: None,
            start_paused: false,
        }
    }
}

enum Command {
    Pause,
    Resume,
    Force,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportKind {
    Periodic,
    Forced,
    Summary,
}

impl ReportKind {
    fn as_str(self) -> &'static str {
        match self {
            ReportKind::Periodic => "periodic",
            ReportKind::Forced => "forced",
            ReportKind::Summary => "summary",
        }
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    timestamp_ns: u64,
    kind: &'a str,
    active_threads: u32,
    totals: MetricsTotals,
    rates: MetricsRates,
    threads: Vec<JsonThread>,
}

#[derive(Serialize)]
struct JsonThread {
    slot_index: u32,
    thread_id: u64,
    metrics: ThreadMetricsSnapshot,
    index_mode: &'static str,
    detail_mode: &'static str,
}

pub struct MetricsReporter {
    tx: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl MetricsReporter {
    /// Spawn the reporter thread. A failed spawn logs and degrades to a
    /// no-op reporter rather than failing the session.
    #[must_use]
    pub fn spawn(inner: Arc<SessionInner>, config: ReporterConfig) -> Self {
        let (tx, rx) = bounded(8);
        let handle = std::thread::Builder::new()
            .name("tracelane-metrics".into())
            .spawn(move || run(&inner, &config, &rx))
            .map_err(|e| warn!("metrics reporter did not start: {e}"))
            .ok();
        Self { tx, handle }
    }

    pub fn pause(&self) {
        let _ = self.tx.send(Command::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(Command::Resume);
    }

    /// Emit a report now, regardless of pause state.
    pub fn force_report(&self) {
        let _ = self.tx.send(Command::Force);
    }

    /// Emit a final summary and join the thread.
    pub fn stop(mut self) {
        let _ = self.tx.send(Command::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    inner: &Arc<SessionInner>,
    config: &ReporterConfig,
    rx: &crossbeam_channel::Receiver<Command>,
) {
    let mut paused = config.start_paused;
    let mut json_file = config.json_path.as_ref().and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| warn!("metrics json output {} unavailable: {e}", path.display()))
            .ok()
    });
    let interval = Duration::from_millis(config.interval_ms.max(1));
    let mut window = (MetricsTotals::default(), monotonic_now_ns());

    loop {
        match rx.recv_timeout(interval) {
            Ok(Command::Stop) => {
                emit(inner, json_file.as_mut(), ReportKind::Summary, &mut window);
                break;
            }
            Ok(Command::Force) => {
                emit(inner, json_file.as_mut(), ReportKind::Forced, &mut window);
            }
            Ok(Command::Pause) => paused = true,
            Ok(Command::Resume) => paused = false,
            Err(RecvTimeoutError::Timeout) => {
                if !paused {
                    emit(inner, json_file.as_mut(), ReportKind::Periodic, &mut window);
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn emit(
    inner: &Arc<SessionInner>,
    json_file: Option<&mut std::fs::File>,
    kind: ReportKind,
    window: &mut (MetricsTotals, u64),
) {
    let mut threads = Vec::new();
    let mut lines = Vec::new();
    let mut totals = MetricsTotals::default();

    for slot in inner.registry().claimed_slots() {
        let metrics = slot.metrics().snapshot();
        totals.accumulate(&metrics);
        lines.push((slot.slot_index().0, slot.thread_id(), metrics));
        threads.push(JsonThread {
            slot_index: slot.slot_index().0,
            thread_id: slot.thread_id(),
            metrics,
            index_mode: slot.backpressure(LaneKind::Index).mode().as_str(),
            detail_mode: slot.backpressure(LaneKind::Detail).mode().as_str(),
        });
    }

    let now = monotonic_now_ns();
    let (previous, window_start) = *window;
    let rates = compute_rates(&previous, &totals, now.saturating_sub(window_start));
    *window = (totals, now);

    let active_threads = inner.registry().active_count();
    info!(
        "metrics[{}] {}",
        kind.as_str(),
        format_human_report(active_threads, &totals, &rates, &lines)
    );

    if let Some(file) = json_file {
        let report = JsonReport {
            timestamp_ns: now,
            kind: kind.as_str(),
            active_threads,
            totals,
            rates,
            threads,
        };
        match serde_json::to_string(&report) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!("metrics json write failed: {e}");
                }
            }
            Err(e) => warn!("metrics json serialization failed: {e}"),
        }
    }
}
