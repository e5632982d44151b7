//! Session configuration and its repairing validator.

use std::path::PathBuf;

use tracelane_common::{
    detail_record_bytes, DEFAULT_STACK_BYTES, INDEX_EVENT_BYTES, MAX_STACK_BYTES, MAX_THREADS,
};

use crate::backpressure::BackpressureConfig;
use crate::domain::DetailPersistence;
use crate::drain::DrainConfig;
use crate::metrics::ReporterConfig;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Max registered threads; structural, 1..=64.
    pub capacity: u32,
    /// Rings per lane; 1 is allowed (drop-oldest then applies to the
    /// active ring only).
    pub rings_per_lane: u32,
    /// Per-ring capacities; powers of two.
    pub ring_bytes_index: u32,
    pub ring_bytes_detail: u32,
    /// Bytes captured per detail event's stack snapshot; 0 is valid.
    pub stack_bytes: u32,
    /// Directory under which the session directory is created.
    pub output_root: PathBuf,
    /// Session directory name; generated from pid + wall clock if absent.
    pub session_label: Option<String>,
    pub drain: DrainConfig,
    pub backpressure: BackpressureConfig,
    pub detail_persistence: DetailPersistence,
    /// Periodic metrics reporter; off when `None`.
    pub reporter: Option<ReporterConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_THREADS as u32,
            rings_per_lane: 8,
            ring_bytes_index: 64 * 1024,
            ring_bytes_detail: 256 * 1024,
            stack_bytes: DEFAULT_STACK_BYTES,
            output_root: PathBuf::from("./traces"),
            session_label: None,
            drain: DrainConfig::default(),
            backpressure: BackpressureConfig::default(),
            detail_persistence: DetailPersistence::Always,
            reporter: None,
        }
    }
}

impl SessionConfig {
    /// Repair soft configuration problems in place. Returns false when
    /// anything had to be repaired; the session still starts. Structural
    /// problems (capacity, unwritable output root) are not repaired here —
    /// they fail `Session::start`.
    pub fn validate(&mut self) -> bool {
        let mut valid = true;

        if self.rings_per_lane == 0 {
            self.rings_per_lane = 8;
            valid = false;
        }
        if self.rings_per_lane > 64 {
            self.rings_per_lane = 64;
            valid = false;
        }
        if self.stack_bytes > MAX_STACK_BYTES {
            self.stack_bytes = MAX_STACK_BYTES;
            valid = false;
        }

        let index_min = (INDEX_EVENT_BYTES as u32 * 2).next_power_of_two();
        let repaired_index = repair_ring_bytes(self.ring_bytes_index, index_min);
        if repaired_index != self.ring_bytes_index {
            self.ring_bytes_index = repaired_index;
            valid = false;
        }

        let detail_min = (detail_record_bytes(self.stack_bytes) as u32 * 2).next_power_of_two();
        let repaired_detail = repair_ring_bytes(self.ring_bytes_detail, detail_min);
        if repaired_detail != self.ring_bytes_detail {
            self.ring_bytes_detail = repaired_detail;
            valid = false;
        }

        if !self.backpressure.validate() {
            valid = false;
        }
        valid
    }

    /// Total ring memory the registry will preallocate.
    #[must_use]
    pub fn arena_bytes(&self) -> u64 {
        u64::from(self.capacity)
            * u64::from(self.rings_per_lane)
            * (u64::from(self.ring_bytes_index) + u64::from(self.ring_bytes_detail))
    }
}

fn repair_ring_bytes(requested: u32, min: u32) -> u32 {
    let mut bytes = requested.max(min);
    if !bytes.is_power_of_two() {
        bytes = bytes.next_power_of_two();
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let mut cfg = SessionConfig::default();
        assert!(cfg.validate());
    }

    #[test]
    fn repairs_non_power_of_two_ring_bytes() {
        let mut cfg = SessionConfig {
            ring_bytes_index: 3000,
            ..SessionConfig::default()
        };
        assert!(!cfg.validate());
        assert_eq!(cfg.ring_bytes_index, 4096);
    }

    #[test]
    fn repairs_undersized_detail_ring_for_stack_bytes() {
        let mut cfg = SessionConfig {
            stack_bytes: 4096,
            ring_bytes_detail: 1024,
            ..SessionConfig::default()
        };
        assert!(!cfg.validate());
        // Detail record is 64 + 4096 bytes; the ring must hold two.
        assert!(cfg.ring_bytes_detail >= 2 * (64 + 4096));
        assert!(cfg.ring_bytes_detail.is_power_of_two());
    }

    #[test]
    fn validate_is_idempotent_after_repair() {
        let mut cfg = SessionConfig {
            rings_per_lane: 0,
            ring_bytes_index: 5,
            stack_bytes: 1 << 20,
            ..SessionConfig::default()
        };
        assert!(!cfg.validate());
        let repaired_rings = cfg.rings_per_lane;
        let repaired_bytes = cfg.ring_bytes_index;
        assert!(cfg.validate());
        assert_eq!(cfg.rings_per_lane, repaired_rings);
        assert_eq!(cfg.ring_bytes_index, repaired_bytes);
    }

    #[test]
    fn arena_bytes_reflects_geometry() {
        let cfg = SessionConfig {
            capacity: 2,
            rings_per_lane: 4,
            ring_bytes_index: 1024,
            ring_bytes_detail: 2048,
            ..SessionConfig::default()
        };
        assert_eq!(cfg.arena_bytes(), 2 * 4 * (1024 + 2048));
    }
}
