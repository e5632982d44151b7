//! # Producer fast path
//!
//! The functions the instrumentation hooks call on the traced thread. The
//! steady-state cost of `trace_index` is a TLS load, an active-ring load,
//! and one ring write; the first call on a thread additionally registers it
//! (the only mutex in the producer's life, bounded by slot allocation).
//!
//! The sequence on a full ring:
//!
//! 1. `swap_active` publishes the ring and adopts a free one; retry the
//!    write (guaranteed against an empty ring larger than the record).
//! 2. On pool exhaustion, report it to backpressure, drop the oldest record
//!    in the lane's backlog, and retry once.
//! 3. Still failing: drop this event and account it.
//!
//! Rejected events land on the producer's metrics and the backpressure
//! counters; drop-oldest victims (already counted as written at their own
//! call) land on the backpressure counters only. Drops are invisible to the
//! stream itself; consumers reconstruct loss from counter deltas.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracelane_common::{DetailEventHeader, IndexEvent, DETAIL_FLAG_MARKED, DETAIL_HEADER_BYTES};

use crate::clock::monotonic_now_ns;
use crate::domain::{CaptureError, LaneKind};
use crate::registry::ThreadLaneSet;
use crate::session::{current_epoch, current_session, SessionInner};

use super::lane::SwapOutcome;

/// Agent-assigned thread identifiers: small, dense, stable for the life of
/// the OS thread. Carried in every event and in the manifest.
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    static PRODUCER: RefCell<Option<ProducerSlot>> = const { RefCell::new(None) };
}

struct ProducerSlot {
    epoch: u64,
    session: Arc<SessionInner>,
    slot_index: u32,
    /// Preallocated assembly buffer for detail records; sized to the
    /// session's detail element so the hot path never allocates.
    detail_scratch: Vec<u8>,
}

fn this_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Record a call/return skeleton event. Safe to invoke from any thread at
/// any time; returns in bounded time without blocking. Silently lossy when
/// no session is accepting or the registry is at capacity.
pub fn trace_index(function_id: u64, kind: u32, depth: u32) {
    with_slot(|slot, _scratch| {
        let now = monotonic_now_ns();
        let event = IndexEvent {
            timestamp_ns: now,
            function_id,
            thread_id: slot.thread_id() as u32,
            kind,
            call_depth: depth,
            _reserved: 0,
        };
        write_record(slot, LaneKind::Index, event.as_bytes(), now);
    });
}

/// Record a detail event carrying machine context and a bounded stack
/// snapshot. The snapshot is truncated to the session's configured size;
/// zero-length snapshots are valid.
pub fn trace_detail(
    function_id: u64,
    kind: u32,
    depth: u32,
    lr: u64,
    fp: u64,
    sp: u64,
    stack: &[u8],
) {
    emit_detail(function_id, kind, depth, lr, fp, sp, stack, 0);
}

/// Like [`trace_detail`], but flags the record as a persistence trigger for
/// the `marked` detail policy.
pub fn trace_detail_marked(
    function_id: u64,
    kind: u32,
    depth: u32,
    lr: u64,
    fp: u64,
    sp: u64,
    stack: &[u8],
) {
    emit_detail(function_id, kind, depth, lr, fp, sp, stack, DETAIL_FLAG_MARKED);
}

#[allow(clippy::too_many_arguments)]
fn emit_detail(
    function_id: u64,
    kind: u32,
    depth: u32,
    lr: u64,
    fp: u64,
    sp: u64,
    stack: &[u8],
    flags: u32,
) {
    with_slot(|slot, scratch| {
        let now = monotonic_now_ns();
        let record_size = slot.detail_lane().element_size() as usize;
        let stack_capacity = record_size - DETAIL_HEADER_BYTES;
        let stack_len = stack.len().min(stack_capacity);

        let header = DetailEventHeader {
            timestamp_ns: now,
            function_id,
            thread_id: slot.thread_id() as u32,
            kind,
            call_depth: depth,
            _reserved: 0,
            lr,
            fp,
            sp,
            stack_len: stack_len as u32,
            flags,
        };

        scratch.clear();
        scratch.resize(record_size, 0);
        scratch[..DETAIL_HEADER_BYTES].copy_from_slice(header.as_bytes());
        scratch[DETAIL_HEADER_BYTES..DETAIL_HEADER_BYTES + stack_len]
            .copy_from_slice(&stack[..stack_len]);

        write_record(slot, LaneKind::Detail, scratch, now);
    });
}

/// Resolve the thread's slot through the TLS cache, registering on first
/// touch, then run `f` against it. Does nothing when no session accepts.
fn with_slot(f: impl FnOnce(&ThreadLaneSet, &mut Vec<u8>)) {
    PRODUCER.with(|cell| {
        let mut cache = cell.borrow_mut();

        let epoch_now = current_epoch();
        if cache.as_ref().is_some_and(|p| p.epoch != epoch_now) {
            // A different session (or none) is installed; the cached slot
            // belongs to a dead epoch.
            *cache = None;
        }

        if cache.is_none() {
            let Some((epoch, session)) = current_session() else {
                return;
            };
            if !session.is_accepting() {
                return;
            }
            let t0 = monotonic_now_ns();
            let Some(slot) = session.registry.register(this_thread_id()) else {
                // Registry full: this event is lost; later calls retry.
                session.unregistered_drops.fetch_add(1, Ordering::Relaxed);
                return;
            };
            slot.metrics()
                .registration_ns
                .store(monotonic_now_ns() - t0, Ordering::Relaxed);
            let detail_element = slot.detail_lane().element_size() as usize;
            let slot_index = slot.slot_index().0;
            *cache = Some(ProducerSlot {
                epoch,
                session,
                slot_index,
                detail_scratch: Vec::with_capacity(detail_element),
            });
        }

        let producer = cache.as_mut().expect("cache populated above");
        if !producer.session.is_accepting() {
            // Session is stopping; drop silently per the shutdown contract.
            return;
        }
        let Some(slot) = producer.session.registry.slot_at(producer.slot_index) else {
            return;
        };
        f(slot, &mut producer.detail_scratch);
    });
}

/// Steps 3-5 of the fast path: write, swap on full, drop-oldest on
/// exhaustion, account the loss.
fn write_record(slot: &ThreadLaneSet, kind: LaneKind, bytes: &[u8], now: u64) {
    let lane = slot.lane(kind);
    let metrics = slot.metrics();
    let backpressure = slot.backpressure(kind);
    let len = bytes.len() as u64;

    if lane.active_ring().write(bytes).is_ok() {
        metrics.record_write(len);
        return;
    }

    // Victims of the drop-oldest policy were already counted as written at
    // their own call, so they land on the backpressure counters only; the
    // producer metrics keep `written + dropped == attempts` exact.
    match lane.swap_active() {
        Ok(outcome) => {
            metrics.record_swap();
            if let SwapOutcome::Requeued { lost_records, lost_bytes } = outcome {
                let each = if lost_records == 0 {
                    0
                } else {
                    (lost_bytes / u64::from(lost_records)) as usize
                };
                for _ in 0..lost_records {
                    backpressure.on_drop(each, now);
                }
            }
            backpressure.sample(lane.free_ring_count(), now);
            if lane.active_ring().write(bytes).is_ok() {
                metrics.record_write(len);
                return;
            }
            // A fresh ring that cannot hold the record; nothing to retry.
            metrics.record_drop(len);
            backpressure.on_drop(bytes.len(), now);
        }
        Err(CaptureError::PoolExhausted) => {
            backpressure.on_exhaustion(now);
            if let Some(dropped) = lane.handle_exhaustion() {
                backpressure.on_drop(dropped as usize, now);
            }
            if lane.active_ring().write(bytes).is_ok() {
                metrics.record_write(len);
                return;
            }
            metrics.record_drop(len);
            backpressure.on_drop(bytes.len(), now);
        }
        Err(_) => {
            metrics.record_drop(len);
            backpressure.on_drop(bytes.len(), now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::{BackpressureConfig, BackpressureMode};
    use crate::registry::{RegistryConfig, ThreadRegistry};
    use tracelane_common::EVENT_KIND_CALL;

    fn slot_with_rings(rings: u32) -> (ThreadRegistry, u64) {
        let registry = ThreadRegistry::new(&RegistryConfig {
            capacity: 1,
            rings_per_lane: rings,
            ring_bytes_index: 128, // 3 records per ring after slack
            ring_bytes_detail: 1024,
            stack_bytes: 32,
            backpressure: BackpressureConfig::default(),
        })
        .unwrap();
        (registry, 11)
    }

    fn event() -> IndexEvent {
        IndexEvent {
            timestamp_ns: 1,
            function_id: 2,
            thread_id: 3,
            kind: EVENT_KIND_CALL,
            call_depth: 0,
            _reserved: 0,
        }
    }

    #[test]
    fn write_record_swaps_when_ring_fills() {
        let (registry, tid) = slot_with_rings(4);
        let slot = registry.register(tid).unwrap();
        // 128-byte ring holds 3 x 32-byte records.
        for i in 0..4 {
            write_record(slot, LaneKind::Index, event().as_bytes(), 100 + i);
        }
        let snap = slot.metrics().snapshot();
        assert_eq!(snap.events_written, 4);
        assert_eq!(snap.events_dropped, 0);
        assert_eq!(snap.ring_swaps, 1);
        assert_eq!(slot.index_lane().submitted_count(), 1);
    }

    #[test]
    fn exhaustion_drops_oldest_and_keeps_writing() {
        let (registry, tid) = slot_with_rings(1);
        let slot = registry.register(tid).unwrap();
        // Fill the single ring, then one more: swap must fail, drop-oldest
        // frees one record slot, and the new event lands.
        for i in 0..4u64 {
            write_record(slot, LaneKind::Index, event().as_bytes(), 100 + i);
        }
        let snap = slot.metrics().snapshot();
        assert_eq!(snap.events_written, 4);
        // The victim was a previously written record: it lands on the
        // backpressure counters, not the producer's dropped count.
        assert_eq!(snap.events_dropped, 0);
        assert_eq!(
            slot.backpressure(LaneKind::Index).mode(),
            BackpressureMode::Dropping
        );
        assert_eq!(slot.backpressure(LaneKind::Index).events_dropped(), 1);
    }

    #[test]
    fn written_plus_dropped_equals_attempts() {
        let (registry, tid) = slot_with_rings(2);
        let slot = registry.register(tid).unwrap();
        let attempts = 50u64;
        for i in 0..attempts {
            write_record(slot, LaneKind::Index, event().as_bytes(), i);
        }
        let snap = slot.metrics().snapshot();
        assert_eq!(snap.events_written + snap.events_dropped, attempts);
    }
}
