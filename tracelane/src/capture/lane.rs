//! # Lane: a bounded ring pool with submit/free hand-off queues
//!
//! Each registered thread owns two lanes (index and detail). A lane owns N
//! rings and two SPSC index queues:
//!
//! ```text
//!            ┌────────────── submit (full rings) ──────────────▶ drain
//!  producer ─┤  active ring
//!            └◀───────────── free (emptied rings) ─────────────── drain
//! ```
//!
//! Invariant: every ring index is in exactly one of {active, submit queue,
//! free queue, in flight with the drain}. The queues are sized to the pool,
//! so an enqueue under that invariant cannot overflow.
//!
//! Producer-side operations: [`Lane::active_ring`], [`Lane::swap_active`],
//! [`Lane::handle_exhaustion`]. Drain-side operations:
//! [`Lane::take_submitted`], [`Lane::return_ring`]. Mixing sides breaks the
//! SPSC contracts.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::domain::{CaptureError, LaneKind};

use super::ring_buffer::RingBuffer;

/// SPSC queue of ring indices with monotonic cursors.
struct IndexQueue {
    slots: Box<[AtomicU32]>,
    mask: u32,
    /// Consumer cursor; grows without masking.
    head: AtomicU32,
    /// Producer cursor; grows without masking.
    tail: AtomicU32,
}

impl IndexQueue {
    fn new(min_capacity: u32) -> Self {
        let cap = min_capacity.max(2).next_power_of_two();
        let slots = (0..cap).map(|_| AtomicU32::new(u32::MAX)).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            mask: cap - 1,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    fn push(&self, value: u32) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) > self.mask {
            return false;
        }
        self.slots[(tail & self.mask) as usize].store(value, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    fn pop(&self) -> Option<u32> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let value = self.slots[(head & self.mask) as usize].load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Read the head entry without consuming it. May observe a stale value
    /// when the consumer advances concurrently; callers tolerate that (the
    /// only caller is the exhaustion path, where a misdirected drop-oldest
    /// costs at most one record).
    fn peek(&self) -> Option<u32> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        Some(self.slots[(head & self.mask) as usize].load(Ordering::Acquire))
    }

    fn len(&self) -> u32 {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }
}

/// Outcome of a successful [`Lane::swap_active`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The previous active ring was published to the drain.
    Published,
    /// The submit queue rejected the ring; it was reset and returned to the
    /// free queue, losing its payload. Carries the lost record count and
    /// bytes for drop accounting.
    Requeued { lost_records: u32, lost_bytes: u64 },
}

/// A bounded pool of rings plus its submit/free hand-off queues.
pub struct Lane {
    kind: LaneKind,
    rings: Box<[RingBuffer]>,
    submit: IndexQueue,
    free: IndexQueue,
    active_ring_idx: AtomicU32,
}

impl Lane {
    /// Build a lane of `ring_count` rings, each `ring_bytes` large and
    /// carrying `element_size`-byte records. Ring 0 starts active; the rest
    /// start in the free queue.
    pub fn new(
        kind: LaneKind,
        ring_count: u32,
        ring_bytes: u32,
        element_size: u32,
    ) -> Result<Self, CaptureError> {
        let rings = (0..ring_count)
            .map(|_| RingBuffer::new(ring_bytes, element_size))
            .collect::<Result<Vec<_>, _>>()?;
        let free = IndexQueue::new(ring_count);
        for idx in 1..ring_count {
            free.push(idx);
        }
        Ok(Self {
            kind,
            rings: rings.into_boxed_slice(),
            submit: IndexQueue::new(ring_count),
            free,
            active_ring_idx: AtomicU32::new(0),
        })
    }

    #[must_use]
    pub fn kind(&self) -> LaneKind {
        self.kind
    }

    #[must_use]
    pub fn total_rings(&self) -> u32 {
        self.rings.len() as u32
    }

    #[must_use]
    pub fn element_size(&self) -> u32 {
        self.rings[0].element_size()
    }

    /// Free rings currently available to the producer. Sampled by the
    /// backpressure state machine.
    #[must_use]
    pub fn free_ring_count(&self) -> u32 {
        self.free.len()
    }

    #[must_use]
    pub fn submitted_count(&self) -> u32 {
        self.submit.len()
    }

    #[must_use]
    pub fn ring(&self, idx: u32) -> &RingBuffer {
        &self.rings[idx as usize]
    }

    /// The ring the producer is currently writing into. Never blocks, never
    /// fails.
    #[must_use]
    pub fn active_ring(&self) -> &RingBuffer {
        let idx = self.active_ring_idx.load(Ordering::Relaxed);
        &self.rings[idx as usize]
    }

    /// Producer side: publish the active ring to the drain and adopt a
    /// fresh ring from the free queue.
    pub fn swap_active(&self) -> Result<SwapOutcome, CaptureError> {
        let Some(fresh) = self.free.pop() else {
            return Err(CaptureError::PoolExhausted);
        };
        let old = self.active_ring_idx.load(Ordering::Relaxed);
        self.active_ring_idx.store(fresh, Ordering::Relaxed);

        if self.submit.push(old) {
            return Ok(SwapOutcome::Published);
        }

        // Cannot happen while the ring-conservation invariant holds, but a
        // leaked ring would starve the producer forever, so requeue: reset
        // the payload and hand the ring back to the free queue.
        let ring = &self.rings[old as usize];
        let lost_records = ring.len();
        let lost_bytes = u64::from(lost_records) * u64::from(ring.element_size());
        ring.reset();
        self.free.push(old);
        Ok(SwapOutcome::Requeued { lost_records, lost_bytes })
    }

    /// Drain side: consume the oldest submitted ring index, if any.
    #[must_use]
    pub fn take_submitted(&self) -> Option<u32> {
        self.submit.pop()
    }

    /// Drain side: hand an emptied ring back to the producer. The free
    /// queue is sized to the pool, so this cannot overflow under the
    /// conservation invariant.
    pub fn return_ring(&self, idx: u32) -> bool {
        self.free.push(idx)
    }

    /// Drop-oldest policy for pool exhaustion: discard the oldest record of
    /// the oldest submitted ring, or of the active ring when nothing is
    /// submitted. Returns the dropped record size, or `None` when every
    /// candidate ring was empty.
    pub fn handle_exhaustion(&self) -> Option<u32> {
        if let Some(idx) = self.submit.peek() {
            let ring = &self.rings[idx as usize];
            if ring.drop_oldest() {
                return Some(ring.element_size());
            }
        }
        let ring = self.active_ring();
        if ring.drop_oldest() {
            Some(ring.element_size())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_lane(rings: u32) -> Lane {
        Lane::new(LaneKind::Index, rings, 256, 32).expect("lane")
    }

    #[test]
    fn new_lane_has_one_active_rest_free() {
        let lane = index_lane(4);
        assert_eq!(lane.total_rings(), 4);
        assert_eq!(lane.free_ring_count(), 3);
        assert_eq!(lane.submitted_count(), 0);
    }

    #[test]
    fn swap_publishes_and_adopts_fifo() {
        let lane = index_lane(4);
        lane.active_ring().write(&[1u8; 32]).unwrap();
        assert_eq!(lane.swap_active().unwrap(), SwapOutcome::Published);
        assert_eq!(lane.free_ring_count(), 2);
        assert_eq!(lane.submitted_count(), 1);

        // Oldest submitted comes out first.
        lane.active_ring().write(&[2u8; 32]).unwrap();
        assert_eq!(lane.swap_active().unwrap(), SwapOutcome::Published);
        let first = lane.take_submitted().unwrap();
        assert_eq!(lane.ring(first).len(), 1);
        let mut out = Vec::new();
        lane.ring(first).read_into(&mut out, 4);
        assert_eq!(out[0], 1);
    }

    #[test]
    fn drain_round_trip_restores_free_count() {
        let lane = index_lane(4);
        let before = lane.free_ring_count();
        lane.swap_active().unwrap();
        let idx = lane.take_submitted().unwrap();
        let mut scratch = Vec::new();
        lane.ring(idx).read_into(&mut scratch, u32::MAX);
        assert!(lane.return_ring(idx));
        assert_eq!(lane.free_ring_count(), before);
    }

    #[test]
    fn pool_of_one_always_exhausts() {
        let lane = index_lane(1);
        assert!(matches!(
            lane.swap_active(),
            Err(CaptureError::PoolExhausted)
        ));
        // Drop-oldest applies within the active ring.
        lane.active_ring().write(&[7u8; 32]).unwrap();
        assert_eq!(lane.handle_exhaustion(), Some(32));
        assert!(lane.active_ring().is_empty());
    }

    #[test]
    fn exhaustion_prefers_submitted_backlog() {
        let lane = index_lane(2);
        lane.active_ring().write(&[1u8; 32]).unwrap();
        lane.swap_active().unwrap(); // ring 0 submitted with one record
        lane.active_ring().write(&[2u8; 32]).unwrap();

        assert_eq!(lane.handle_exhaustion(), Some(32));
        // The submitted ring lost its record; the active ring kept its own.
        let idx = lane.take_submitted().unwrap();
        assert!(lane.ring(idx).is_empty());
        assert_eq!(lane.active_ring().len(), 1);
    }

    #[test]
    fn exhaustion_with_everything_empty_drops_nothing() {
        let lane = index_lane(1);
        assert_eq!(lane.handle_exhaustion(), None);
    }
}
