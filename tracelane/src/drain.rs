//! # Drain worker
//!
//! The single consumer thread of the whole pipeline. It round-robins over
//! every registered slot, moves published rings to the per-thread files,
//! hands emptied rings back to producers, and keeps the backpressure state
//! machines fed with samples.
//!
//! ## Loop shape
//!
//! ```text
//! while RUNNING:
//!     for each slot (round-robin start):          ── one cycle
//!         drain index lane   (≤ effective limit)
//!         drain detail lane  (≤ effective limit)
//!         sample backpressure
//!     idle? yield or sleep poll_interval_us
//! on STOPPING:
//!     final pass with unbounded limit, repeated until a full
//!     cycle does no work; also flushes each lane's active ring
//! ```
//!
//! The fairness limit is `min(max_batch_size, fairness_quantum)` rings per
//! lane per cycle (0 means unbounded); a lane that hits it counts a
//! fairness switch, so no slot can monopolize the drain under skew.
//!
//! Writer I/O errors are counted and the ring is still returned to the free
//! queue; the producer must keep moving.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::warn;
use tracelane_common::{DetailEventHeader, DETAIL_FLAG_MARKED};

use crate::clock::monotonic_now_ns;
use crate::domain::{DetailPersistence, LaneKind, SessionError};
use crate::metrics::{DrainMetrics, DrainMetricsSnapshot};
use crate::registry::{ThreadLaneSet, ThreadRegistry};
use crate::writer::SessionWriter;

/// Drain loop tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainConfig {
    /// Idle sleep between empty cycles; 0 spin-polls.
    pub poll_interval_us: u64,
    /// Rings drained per lane per cycle; 0 means unbounded.
    pub max_batch_size: u32,
    /// Upper bound on the batch size for fairness; 0 disables.
    pub fairness_quantum: u32,
    /// Yield instead of sleeping on idle cycles.
    pub yield_on_idle: bool,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval_us: 1000,
            max_batch_size: 8,
            fairness_quantum: 8,
            yield_on_idle: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Initialized,
    Running,
    Stopping,
    Stopped,
}

impl DrainState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => DrainState::Running,
            2 => DrainState::Stopping,
            3 => DrainState::Stopped,
            _ => DrainState::Initialized,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DrainState::Initialized => "INITIALIZED",
            DrainState::Running => "RUNNING",
            DrainState::Stopping => "STOPPING",
            DrainState::Stopped => "STOPPED",
        }
    }
}

struct DrainShared {
    state: AtomicU8,
    rr_cursor: AtomicU32,
    last_cycle_ns: AtomicU64,
    metrics: DrainMetrics,
    config: DrainConfig,
    detail_persistence: DetailPersistence,
    registry: Arc<ThreadRegistry>,
}

/// Owns the drain thread and its writer for one session.
pub struct DrainWorker {
    shared: Arc<DrainShared>,
    writer: Option<SessionWriter>,
    handle: Option<JoinHandle<SessionWriter>>,
    lifecycle: Mutex<()>,
}

impl DrainWorker {
    #[must_use]
    pub fn new(
        registry: Arc<ThreadRegistry>,
        writer: SessionWriter,
        config: DrainConfig,
        detail_persistence: DetailPersistence,
    ) -> Self {
        Self {
            shared: Arc::new(DrainShared {
                state: AtomicU8::new(DrainState::Initialized as u8),
                rr_cursor: AtomicU32::new(0),
                last_cycle_ns: AtomicU64::new(monotonic_now_ns()),
                metrics: DrainMetrics::new(),
                config,
                detail_persistence,
                registry,
            }),
            writer: Some(writer),
            handle: None,
            lifecycle: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn state(&self) -> DrainState {
        DrainState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn metrics(&self) -> DrainMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Spawn the worker thread. Idempotent while running; starting after a
    /// stop fails.
    pub fn start(&mut self) -> Result<(), SessionError> {
        let _guard = self.lifecycle.lock().expect("drain lifecycle poisoned");

        match self.shared.state.compare_exchange(
            DrainState::Initialized as u8,
            DrainState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(observed) => {
                return match DrainState::from_u8(observed) {
                    DrainState::Running => Ok(()),
                    _ => Err(SessionError::AlreadyTerminated),
                };
            }
        }

        let shared = Arc::clone(&self.shared);
        let writer = self.writer.take().expect("writer available before start");
        let handle = std::thread::Builder::new()
            .name("tracelane-drain".into())
            .spawn(move || Self::run(&shared, writer))
            .map_err(SessionError::Io)?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Request the final pass and join the worker. Returns the writer for
    /// finalization. Idempotent; later calls return `None`.
    pub fn stop(&mut self) -> Result<Option<SessionWriter>, SessionError> {
        let _guard = self.lifecycle.lock().expect("drain lifecycle poisoned");

        let state = DrainState::from_u8(self.shared.state.load(Ordering::Acquire));
        if state == DrainState::Initialized {
            // Never started; nothing buffered anywhere but the writer may
            // still need finalizing.
            self.shared
                .state
                .store(DrainState::Stopped as u8, Ordering::Release);
            return Ok(self.writer.take());
        }
        if state == DrainState::Running {
            self.shared
                .state
                .store(DrainState::Stopping as u8, Ordering::Release);
        }
        match self.handle.take() {
            Some(handle) => {
                let writer = handle.join().map_err(|_| {
                    SessionError::Io(std::io::Error::other("drain worker panicked"))
                })?;
                Ok(Some(writer))
            }
            None => Ok(None),
        }
    }

    fn run(shared: &DrainShared, mut writer: SessionWriter) -> SessionWriter {
        let mut scratch = Vec::with_capacity(64 * 1024);

        while DrainState::from_u8(shared.state.load(Ordering::Acquire)) == DrainState::Running {
            let work = Self::cycle(shared, &mut writer, &mut scratch, false);
            shared.metrics.cycles_total.fetch_add(1, Ordering::Relaxed);
            if !work {
                shared.metrics.cycles_idle.fetch_add(1, Ordering::Relaxed);
                if shared.config.yield_on_idle {
                    std::thread::yield_now();
                    shared.metrics.yields.fetch_add(1, Ordering::Relaxed);
                } else if shared.config.poll_interval_us > 0 {
                    std::thread::sleep(Duration::from_micros(shared.config.poll_interval_us));
                    shared.metrics.sleeps.fetch_add(1, Ordering::Relaxed);
                    shared
                        .metrics
                        .total_sleep_us
                        .fetch_add(shared.config.poll_interval_us, Ordering::Relaxed);
                }
            }
        }

        // Final pass: unbounded quantum, repeated until a whole cycle finds
        // nothing, so every published ring and every active-ring remainder
        // is persisted.
        shared.metrics.final_drains.fetch_add(1, Ordering::Relaxed);
        loop {
            let work = Self::cycle(shared, &mut writer, &mut scratch, true);
            shared.metrics.cycles_total.fetch_add(1, Ordering::Relaxed);
            if !work {
                break;
            }
        }

        shared
            .state
            .store(DrainState::Stopped as u8, Ordering::Release);
        writer
    }

    fn cycle(
        shared: &DrainShared,
        writer: &mut SessionWriter,
        scratch: &mut Vec<u8>,
        final_pass: bool,
    ) -> bool {
        let capacity = shared.registry.capacity();
        if capacity == 0 {
            return false;
        }
        let start = shared.rr_cursor.load(Ordering::Relaxed) % capacity;
        let mut work_done = false;

        for offset in 0..capacity {
            let slot_index = (start + offset) % capacity;
            let Some(slot) = shared.registry.slot_at(slot_index) else {
                continue;
            };
            // A deactivated slot is left alone mid-session; the final pass
            // still flushes whatever it published before unregistering.
            if !slot.is_active() && !final_pass {
                continue;
            }

            for kind in [LaneKind::Index, LaneKind::Detail] {
                let lane = slot.lane(kind);
                let (processed, hit_limit) =
                    Self::drain_lane(shared, writer, slot, kind, final_pass, scratch);
                if processed > 0 {
                    work_done = true;
                    shared.metrics.record_rings(
                        slot_index as usize,
                        kind == LaneKind::Detail,
                        u64::from(processed),
                    );
                }
                if hit_limit {
                    shared
                        .metrics
                        .fairness_switches
                        .fetch_add(1, Ordering::Relaxed);
                }
                if final_pass && Self::flush_active(shared, writer, slot, kind, scratch) {
                    work_done = true;
                }
                slot.backpressure(kind).sample(lane.free_ring_count(), 0);
            }
        }

        shared
            .rr_cursor
            .store((start + 1) % capacity, Ordering::Relaxed);
        shared
            .last_cycle_ns
            .store(monotonic_now_ns(), Ordering::Relaxed);
        work_done
    }

    fn effective_limit(config: &DrainConfig, final_pass: bool) -> u32 {
        if final_pass {
            return u32::MAX;
        }
        let mut limit = config.max_batch_size;
        let quantum = config.fairness_quantum;
        if limit == 0 {
            limit = quantum;
        } else if quantum > 0 && quantum < limit {
            limit = quantum;
        }
        if limit == 0 {
            u32::MAX
        } else {
            limit
        }
    }

    fn drain_lane(
        shared: &DrainShared,
        writer: &mut SessionWriter,
        slot: &ThreadLaneSet,
        kind: LaneKind,
        final_pass: bool,
        scratch: &mut Vec<u8>,
    ) -> (u32, bool) {
        let lane = slot.lane(kind);
        let limit = Self::effective_limit(&shared.config, final_pass);
        let mut processed = 0u32;

        while processed < limit {
            let Some(idx) = lane.take_submitted() else {
                break;
            };
            let ring = lane.ring(idx);
            scratch.clear();
            ring.read_into(scratch, u32::MAX);

            if Self::should_persist(shared, kind, lane.element_size(), scratch)
                && !scratch.is_empty()
            {
                if let Err(e) = writer.append(slot.slot_index(), kind, scratch) {
                    shared.metrics.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("drain: write failed for {} {}: {e}", slot.slot_index(), kind);
                }
            }

            lane.return_ring(idx);
            slot.backpressure(kind)
                .on_recovery(lane.free_ring_count(), 0);
            processed += 1;
        }

        let hit_limit = limit != u32::MAX && processed == limit;
        (processed, hit_limit)
    }

    /// Final-pass only: persist what the producer never got to publish.
    /// Reading the active ring in place is the ordinary SPSC consumer role,
    /// so a straggling producer write is either picked up by the next cycle
    /// or not yet published.
    fn flush_active(
        shared: &DrainShared,
        writer: &mut SessionWriter,
        slot: &ThreadLaneSet,
        kind: LaneKind,
        scratch: &mut Vec<u8>,
    ) -> bool {
        let lane = slot.lane(kind);
        scratch.clear();
        if lane.active_ring().read_into(scratch, u32::MAX) == 0 {
            return false;
        }
        if Self::should_persist(shared, kind, lane.element_size(), scratch) {
            if let Err(e) = writer.append(slot.slot_index(), kind, scratch) {
                shared.metrics.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!("drain: final flush failed for {} {}: {e}", slot.slot_index(), kind);
            }
        }
        true
    }

    fn should_persist(
        shared: &DrainShared,
        kind: LaneKind,
        element_size: u32,
        payload: &[u8],
    ) -> bool {
        match (kind, shared.detail_persistence) {
            (LaneKind::Index, _) | (LaneKind::Detail, DetailPersistence::Always) => true,
            (LaneKind::Detail, DetailPersistence::Marked) => {
                contains_marked(payload, element_size as usize)
            }
        }
    }
}

impl Drop for DrainWorker {
    fn drop(&mut self) {
        if matches!(self.state(), DrainState::Running | DrainState::Stopping) {
            let _ = self.stop();
        }
    }
}

/// Scan a drained detail payload for any record with the marked flag.
fn contains_marked(payload: &[u8], element_size: usize) -> bool {
    payload
        .chunks_exact(element_size)
        .filter_map(DetailEventHeader::read_from)
        .any(|header| header.flags & DETAIL_FLAG_MARKED != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BackpressureConfig;
    use crate::registry::RegistryConfig;
    use tracelane_common::{IndexEvent, EVENT_KIND_CALL, INDEX_EVENT_BYTES};

    fn registry() -> Arc<ThreadRegistry> {
        Arc::new(
            ThreadRegistry::new(&RegistryConfig {
                capacity: 4,
                rings_per_lane: 4,
                ring_bytes_index: 1024,
                ring_bytes_detail: 4096,
                stack_bytes: 64,
                backpressure: BackpressureConfig::default(),
            })
            .unwrap(),
        )
    }

    fn worker(registry: Arc<ThreadRegistry>, dir: &std::path::Path) -> DrainWorker {
        let writer = SessionWriter::new(dir.to_path_buf(), 4, 32, 64 + 64);
        DrainWorker::new(registry, writer, DrainConfig::default(), DetailPersistence::Always)
    }

    fn event(i: u32) -> IndexEvent {
        IndexEvent {
            timestamp_ns: u64::from(i),
            function_id: 0x1_0000_0001,
            thread_id: 9,
            kind: EVENT_KIND_CALL,
            call_depth: 0,
            _reserved: 0,
        }
    }

    #[test]
    fn effective_limit_combines_batch_and_quantum() {
        let mut cfg = DrainConfig::default();
        cfg.max_batch_size = 8;
        cfg.fairness_quantum = 2;
        assert_eq!(DrainWorker::effective_limit(&cfg, false), 2);
        cfg.fairness_quantum = 0;
        assert_eq!(DrainWorker::effective_limit(&cfg, false), 8);
        cfg.max_batch_size = 0;
        assert_eq!(DrainWorker::effective_limit(&cfg, false), u32::MAX);
        assert_eq!(DrainWorker::effective_limit(&cfg, true), u32::MAX);
    }

    #[test]
    fn lifecycle_double_start_ok_start_after_stop_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = worker(registry(), dir.path());
        assert_eq!(worker.state(), DrainState::Initialized);
        worker.start().unwrap();
        worker.start().unwrap(); // double start is success
        assert_eq!(worker.state(), DrainState::Running);

        let writer = worker.stop().unwrap();
        assert!(writer.is_some());
        assert_eq!(worker.state(), DrainState::Stopped);
        assert!(worker.stop().unwrap().is_none()); // idempotent
        assert!(matches!(
            worker.start(),
            Err(SessionError::AlreadyTerminated)
        ));
        assert!(worker.metrics().final_drains >= 1);
    }

    #[test]
    fn drains_submitted_rings_to_file_and_returns_them() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        let slot = registry.register(9).unwrap();

        // Fill and publish two rings by hand.
        for ring in 0..2u32 {
            for i in 0..3u32 {
                slot.index_lane()
                    .active_ring()
                    .write(event(ring * 3 + i).as_bytes())
                    .unwrap();
            }
            slot.index_lane().swap_active().unwrap();
        }
        assert_eq!(slot.index_lane().submitted_count(), 2);

        let mut worker = worker(Arc::clone(&registry), dir.path());
        worker.start().unwrap();
        let mut writer = worker.stop().unwrap().unwrap();
        writer.finalize(|_| 0).unwrap();

        assert_eq!(slot.index_lane().submitted_count(), 0);
        assert_eq!(slot.index_lane().free_ring_count(), 3);
        let metrics = worker.metrics();
        assert_eq!(metrics.rings_total, 2);
        assert_eq!(metrics.rings_index, 2);

        let bytes = std::fs::read(dir.path().join("thread_0/index.atf")).unwrap();
        let records = (bytes.len() - 64) / INDEX_EVENT_BYTES;
        assert_eq!(records, 6);
    }

    #[test]
    fn final_pass_flushes_unpublished_active_ring() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        let slot = registry.register(9).unwrap();
        for i in 0..5u32 {
            slot.index_lane().active_ring().write(event(i).as_bytes()).unwrap();
        }

        let mut worker = worker(Arc::clone(&registry), dir.path());
        worker.start().unwrap();
        let mut writer = worker.stop().unwrap().unwrap();
        assert_eq!(
            writer.records_written(crate::domain::SlotIndex(0), LaneKind::Index),
            5
        );
        writer.finalize(|_| 0).unwrap();
    }

    #[test]
    fn marked_scan_finds_flagged_record() {
        let element = 64 + 16;
        let mut payload = vec![0u8; element * 2];
        assert!(!contains_marked(&payload, element));

        let header = DetailEventHeader {
            timestamp_ns: 1,
            function_id: 2,
            thread_id: 3,
            kind: EVENT_KIND_CALL,
            call_depth: 0,
            _reserved: 0,
            lr: 0,
            fp: 0,
            sp: 0,
            stack_len: 0,
            flags: DETAIL_FLAG_MARKED,
        };
        payload[element..element + 64].copy_from_slice(header.as_bytes());
        assert!(contains_marked(&payload, element));
    }
}
