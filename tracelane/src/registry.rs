//! # Thread registry
//!
//! Process-wide allocator of per-thread lane sets. Slots are claimed by CAS
//! on a free-slot bitmap at a thread's first event; every slot's lanes and
//! rings are preallocated at construction, so the registry's memory layout
//! is fixed by its configuration and nothing allocates after start.
//!
//! Ownership is a strict tree: registry → slots → lanes → rings. The
//! registered thread borrows its slot through a thread-local pointer for
//! writes; the drain borrows all slots non-exclusively for read-only
//! iteration plus the lanes' SPSC consumer operations.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracelane_common::{detail_record_bytes, INDEX_EVENT_BYTES, MAX_THREADS};

use crate::backpressure::{BackpressureConfig, BackpressureState};
use crate::capture::Lane;
use crate::domain::{LaneKind, SessionError, SlotIndex};
use crate::metrics::ThreadMetrics;

/// Geometry of the registry and every lane in it.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum registered threads, 1..=64.
    pub capacity: u32,
    pub rings_per_lane: u32,
    pub ring_bytes_index: u32,
    pub ring_bytes_detail: u32,
    pub stack_bytes: u32,
    pub backpressure: BackpressureConfig,
}

/// One registered thread's lanes, metrics, and backpressure state.
///
/// Alignment keeps neighbouring slots' hot atomics on separate cache lines.
#[repr(align(64))]
pub struct ThreadLaneSet {
    slot_index: SlotIndex,
    thread_id: AtomicU64,
    active: AtomicBool,
    index_lane: Lane,
    detail_lane: Lane,
    metrics: ThreadMetrics,
    index_backpressure: BackpressureState,
    detail_backpressure: BackpressureState,
}

impl ThreadLaneSet {
    fn new(slot_index: u32, config: &RegistryConfig) -> Result<Self, SessionError> {
        let detail_element = detail_record_bytes(config.stack_bytes) as u32;
        let index_lane = Lane::new(
            LaneKind::Index,
            config.rings_per_lane,
            config.ring_bytes_index,
            INDEX_EVENT_BYTES as u32,
        )
        .map_err(|e| SessionError::InvalidConfig(format!("index lane: {e}")))?;
        let detail_lane = Lane::new(
            LaneKind::Detail,
            config.rings_per_lane,
            config.ring_bytes_detail,
            detail_element,
        )
        .map_err(|e| SessionError::InvalidConfig(format!("detail lane: {e}")))?;

        let index_backpressure = BackpressureState::new(config.backpressure);
        index_backpressure.set_total_rings(config.rings_per_lane);
        let detail_backpressure = BackpressureState::new(config.backpressure);
        detail_backpressure.set_total_rings(config.rings_per_lane);

        Ok(Self {
            slot_index: SlotIndex(slot_index),
            thread_id: AtomicU64::new(0),
            active: AtomicBool::new(false),
            index_lane,
            detail_lane,
            metrics: ThreadMetrics::default(),
            index_backpressure,
            detail_backpressure,
        })
    }

    #[must_use]
    pub fn slot_index(&self) -> SlotIndex {
        self.slot_index
    }

    #[must_use]
    pub fn thread_id(&self) -> u64 {
        self.thread_id.load(Ordering::Relaxed)
    }

    /// Acquire-load so the drain that observes `true` also observes the
    /// slot initialization that preceded the release store.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn lane(&self, kind: LaneKind) -> &Lane {
        match kind {
            LaneKind::Index => &self.index_lane,
            LaneKind::Detail => &self.detail_lane,
        }
    }

    #[must_use]
    pub fn index_lane(&self) -> &Lane {
        &self.index_lane
    }

    #[must_use]
    pub fn detail_lane(&self) -> &Lane {
        &self.detail_lane
    }

    #[must_use]
    pub fn metrics(&self) -> &ThreadMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn backpressure(&self, kind: LaneKind) -> &BackpressureState {
        match kind {
            LaneKind::Index => &self.index_backpressure,
            LaneKind::Detail => &self.detail_backpressure,
        }
    }
}

pub struct ThreadRegistry {
    slots: Box<[ThreadLaneSet]>,
    /// Bit i set ⇔ slot i has been claimed this session.
    bitmap: AtomicU64,
    capacity: u32,
}

impl ThreadRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self, SessionError> {
        if config.capacity == 0 || config.capacity as usize > MAX_THREADS {
            return Err(SessionError::InvalidConfig(format!(
                "registry capacity {} outside 1..={MAX_THREADS}",
                config.capacity
            )));
        }
        let slots = (0..config.capacity)
            .map(|i| ThreadLaneSet::new(i, config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            slots: slots.into_boxed_slice(),
            bitmap: AtomicU64::new(0),
            capacity: config.capacity,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn capacity_mask(&self) -> u64 {
        if self.capacity as usize >= 64 {
            u64::MAX
        } else {
            (1u64 << self.capacity) - 1
        }
    }

    /// Claim a slot for `thread_id`. Returns `None` at capacity; the caller
    /// accounts the event as dropped and may retry on a later call.
    pub fn register(&self, thread_id: u64) -> Option<&ThreadLaneSet> {
        loop {
            let bits = self.bitmap.load(Ordering::Acquire);
            let free = !bits & self.capacity_mask();
            if free == 0 {
                return None;
            }
            let idx = free.trailing_zeros();
            if self
                .bitmap
                .compare_exchange(
                    bits,
                    bits | (1u64 << idx),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                let slot = &self.slots[idx as usize];
                slot.thread_id.store(thread_id, Ordering::Relaxed);
                slot.active.store(true, Ordering::Release);
                return Some(slot);
            }
        }
    }

    /// Deactivate a slot. The drain stops reading it on its next iteration;
    /// the slot's ring memory stays owned by the registry until session end
    /// and the slot is not reissued within this session.
    pub fn unregister(&self, slot: &ThreadLaneSet) {
        slot.active.store(false, Ordering::Release);
    }

    /// Bounded iteration: the slot at `index`, if it has ever been claimed.
    /// Not a live view; callers tolerate `active` flipping mid-iteration.
    #[must_use]
    pub fn slot_at(&self, index: u32) -> Option<&ThreadLaneSet> {
        if index >= self.capacity {
            return None;
        }
        let bits = self.bitmap.load(Ordering::Acquire);
        if bits & (1u64 << index) == 0 {
            return None;
        }
        Some(&self.slots[index as usize])
    }

    /// Slots whose `active` flag is currently set.
    #[must_use]
    pub fn active_count(&self) -> u32 {
        (0..self.capacity)
            .filter_map(|i| self.slot_at(i))
            .filter(|s| s.is_active())
            .count() as u32
    }

    /// Every claimed slot, active or not. Used by the status snapshot and
    /// the manifest.
    pub fn claimed_slots(&self) -> impl Iterator<Item = &ThreadLaneSet> {
        (0..self.capacity).filter_map(|i| self.slot_at(i))
    }
}
