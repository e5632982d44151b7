//! # Per-lane backpressure state machine
//!
//! Classifies free-ring occupancy into four modes and schedules the drop
//! and recovery policies around them:
//!
//! ```text
//!            free% < pressure              free == 0 | exhaustion
//!  NORMAL ──────────────────▶ PRESSURE ──────────────────▶ DROPPING
//!    ▲                           │  ▲                          │
//!    │ stable >= recovery_stable │  │ free% < pressure         │ free% >= recovery
//!    │ and not re-pressured      │  │                          ▼
//!    └──────────────────────── RECOVERY ◀──────────────────────┘
//! ```
//!
//! The mode field is the only acquire/acq_rel atomic; counters are relaxed.
//! Each lane owns one instance; the producer reports exhaustion and drops,
//! the drain reports samples and recovery.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use log::{info, trace};

use crate::clock::monotonic_now_ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackpressureMode {
    Normal,
    Pressure,
    Dropping,
    Recovery,
}

impl BackpressureMode {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BackpressureMode::Pressure,
            2 => BackpressureMode::Dropping,
            3 => BackpressureMode::Recovery,
            _ => BackpressureMode::Normal,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BackpressureMode::Normal => "NORMAL",
            BackpressureMode::Pressure => "PRESSURE",
            BackpressureMode::Dropping => "DROPPING",
            BackpressureMode::Recovery => "RECOVERY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureConfig {
    /// Percent of free rings below which NORMAL becomes PRESSURE. In (0, 100).
    pub pressure_threshold_percent: u32,
    /// Percent of free rings at which DROPPING becomes RECOVERY. In (0, 100],
    /// strictly greater than the pressure threshold.
    pub recovery_threshold_percent: u32,
    /// How long RECOVERY must hold without re-pressure before NORMAL.
    pub recovery_stable_ns: u64,
    /// Emit a human-readable drop log every Nth drop.
    pub drop_log_interval: u32,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            pressure_threshold_percent: 25,
            recovery_threshold_percent: 50,
            recovery_stable_ns: 1_000_000_000,
            drop_log_interval: 64,
        }
    }
}

impl BackpressureConfig {
    /// Repair out-of-range or inverted values in place. Returns false when
    /// anything had to be repaired. Idempotent: validating an already
    /// repaired config changes nothing.
    pub fn validate(&mut self) -> bool {
        let defaults = Self::default();
        let mut valid = true;

        if self.pressure_threshold_percent == 0 || self.pressure_threshold_percent >= 100 {
            self.pressure_threshold_percent = defaults.pressure_threshold_percent;
            valid = false;
        }
        if self.recovery_threshold_percent == 0 || self.recovery_threshold_percent > 100 {
            self.recovery_threshold_percent = defaults.recovery_threshold_percent;
            valid = false;
        }
        if self.pressure_threshold_percent >= self.recovery_threshold_percent {
            if self.pressure_threshold_percent < 95 {
                self.recovery_threshold_percent = self.pressure_threshold_percent + 5;
            } else {
                self.pressure_threshold_percent = defaults.pressure_threshold_percent;
                self.recovery_threshold_percent = defaults.recovery_threshold_percent;
            }
            valid = false;
        }
        if self.drop_log_interval == 0 {
            self.drop_log_interval = defaults.drop_log_interval;
            valid = false;
        }
        if self.recovery_stable_ns == 0 {
            self.recovery_stable_ns = defaults.recovery_stable_ns;
            valid = false;
        }
        valid
    }

    /// Defaults overridden by `BP_PRESSURE_THRESHOLD`, `BP_RECOVERY_THRESHOLD`
    /// and `BP_DROP_LOG_INTERVAL`, then validated.
    #[must_use]
    pub fn from_env() -> Self {
        fn parse(var: &str) -> Option<u32> {
            std::env::var(var).ok()?.trim().parse().ok()
        }
        let mut cfg = Self::default();
        if let Some(v) = parse("BP_PRESSURE_THRESHOLD") {
            cfg.pressure_threshold_percent = v;
        }
        if let Some(v) = parse("BP_RECOVERY_THRESHOLD") {
            cfg.recovery_threshold_percent = v;
        }
        if let Some(v) = parse("BP_DROP_LOG_INTERVAL") {
            cfg.drop_log_interval = v;
        }
        cfg.validate();
        cfg
    }
}

/// Point-in-time view of one lane's backpressure state.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BackpressureSnapshot {
    pub mode: BackpressureMode,
    pub transitions: u64,
    pub events_dropped: u64,
    pub bytes_dropped: u64,
    pub drop_sequences: u64,
    pub free_rings: u32,
    pub total_rings: u32,
    pub low_watermark: u32,
    pub last_drop_ns: u64,
    pub last_recovery_ns: u64,
    pub pressure_start_ns: u64,
}

pub struct BackpressureState {
    mode: AtomicU8,
    transitions: AtomicU64,

    events_dropped: AtomicU64,
    bytes_dropped: AtomicU64,
    drop_sequences: AtomicU64,
    sequence_open: AtomicBool,

    free_rings: AtomicU32,
    total_rings: AtomicU32,
    low_watermark: AtomicU32,

    last_drop_ns: AtomicU64,
    last_recovery_ns: AtomicU64,
    pressure_start_ns: AtomicU64,
    recovery_candidate_ns: AtomicU64,

    config: BackpressureConfig,
}

impl BackpressureState {
    #[must_use]
    pub fn new(mut config: BackpressureConfig) -> Self {
        config.validate();
        Self {
            mode: AtomicU8::new(BackpressureMode::Normal as u8),
            transitions: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
            drop_sequences: AtomicU64::new(0),
            sequence_open: AtomicBool::new(false),
            free_rings: AtomicU32::new(0),
            total_rings: AtomicU32::new(0),
            low_watermark: AtomicU32::new(u32::MAX),
            last_drop_ns: AtomicU64::new(0),
            last_recovery_ns: AtomicU64::new(0),
            pressure_start_ns: AtomicU64::new(0),
            recovery_candidate_ns: AtomicU64::new(0),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Bind the lane's pool size. Only updates on change.
    pub fn set_total_rings(&self, total_rings: u32) {
        if total_rings == 0 {
            return;
        }
        if self.total_rings.load(Ordering::Relaxed) != total_rings {
            self.total_rings.store(total_rings, Ordering::Relaxed);
        }
    }

    /// Inspector view of the mode.
    #[must_use]
    pub fn mode(&self) -> BackpressureMode {
        BackpressureMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    /// Lowest free-ring count ever sampled, or 0 before the first sample.
    #[must_use]
    pub fn low_watermark(&self) -> u32 {
        let low = self.low_watermark.load(Ordering::Relaxed);
        if low == u32::MAX {
            0
        } else {
            low
        }
    }

    fn update_low_watermark(&self, free_rings: u32) {
        let mut low = self.low_watermark.load(Ordering::Relaxed);
        while free_rings < low {
            match self.low_watermark.compare_exchange_weak(
                low,
                free_rings,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => low = current,
            }
        }
    }

    fn total_effective(&self) -> u32 {
        self.total_rings.load(Ordering::Relaxed).max(1)
    }

    fn threshold_crossed(percent: u32, total: u32, free: u32) -> bool {
        if total == 0 {
            return false;
        }
        u64::from(free) * 100 < u64::from(percent) * u64::from(total)
    }

    /// CAS `expected -> desired`, recording transition bookkeeping. A lost
    /// race against another transition is fine; the state machine converges
    /// on the next sample.
    fn transition(&self, expected: BackpressureMode, desired: BackpressureMode, now_ns: u64) {
        let mut current = self.mode.load(Ordering::Acquire);
        while current == expected as u8 {
            match self.mode.compare_exchange_weak(
                current,
                desired as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.transitions.fetch_add(1, Ordering::Relaxed);
                    match desired {
                        BackpressureMode::Pressure => {
                            self.pressure_start_ns.store(now_ns, Ordering::Relaxed);
                        }
                        BackpressureMode::Recovery => {
                            self.recovery_candidate_ns.store(now_ns, Ordering::Relaxed);
                            self.sequence_open.store(false, Ordering::Relaxed);
                        }
                        BackpressureMode::Normal => {
                            self.pressure_start_ns.store(0, Ordering::Relaxed);
                            self.recovery_candidate_ns.store(0, Ordering::Relaxed);
                            self.sequence_open.store(false, Ordering::Relaxed);
                        }
                        BackpressureMode::Dropping => {}
                    }
                    trace!(
                        "backpressure transition {} -> {}",
                        expected.as_str(),
                        desired.as_str()
                    );
                    break;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Record a free-ring sample and advance the state machine. `now_ns`
    /// may be 0 to let the state read the clock itself.
    pub fn sample(&self, free_rings: u32, now_ns: u64) {
        self.free_rings.store(free_rings, Ordering::Relaxed);
        self.update_low_watermark(free_rings);

        let total = self.total_effective();
        let pressure = self.config.pressure_threshold_percent;
        let now = move || if now_ns == 0 { monotonic_now_ns() } else { now_ns };

        match self.mode() {
            BackpressureMode::Normal => {
                if Self::threshold_crossed(pressure, total, free_rings) {
                    self.transition(BackpressureMode::Normal, BackpressureMode::Pressure, now());
                }
            }
            BackpressureMode::Pressure => {
                if free_rings == 0 {
                    self.transition(BackpressureMode::Pressure, BackpressureMode::Dropping, now());
                } else if !Self::threshold_crossed(pressure, total, free_rings) {
                    self.transition(BackpressureMode::Pressure, BackpressureMode::Normal, now());
                }
            }
            BackpressureMode::Dropping => {
                if !Self::threshold_crossed(
                    self.config.recovery_threshold_percent,
                    total,
                    free_rings,
                ) {
                    self.transition(BackpressureMode::Dropping, BackpressureMode::Recovery, now());
                }
            }
            BackpressureMode::Recovery => {
                if Self::threshold_crossed(pressure, total, free_rings) {
                    self.transition(BackpressureMode::Recovery, BackpressureMode::Pressure, now());
                    return;
                }
                let candidate = self.recovery_candidate_ns.load(Ordering::Relaxed);
                let now = now();
                if candidate == 0 {
                    self.recovery_candidate_ns.store(now, Ordering::Relaxed);
                    return;
                }
                if now.saturating_sub(candidate) >= self.config.recovery_stable_ns {
                    self.transition(BackpressureMode::Recovery, BackpressureMode::Normal, now);
                    self.last_recovery_ns.store(now, Ordering::Relaxed);
                }
            }
        }
    }

    /// Pool exhaustion reported by the producer. Forces the mode toward
    /// DROPPING whatever the current mode is.
    pub fn on_exhaustion(&self, now_ns: u64) {
        let now = if now_ns == 0 { monotonic_now_ns() } else { now_ns };
        self.transition(BackpressureMode::Normal, BackpressureMode::Pressure, now);
        self.transition(BackpressureMode::Recovery, BackpressureMode::Dropping, now);
        self.transition(BackpressureMode::Pressure, BackpressureMode::Dropping, now);
        self.transition(BackpressureMode::Normal, BackpressureMode::Dropping, now);
    }

    /// Account one dropped record. A contiguous run of drops counts as one
    /// drop sequence; the sequence closes when the mode leaves DROPPING.
    pub fn on_drop(&self, dropped_bytes: usize, now_ns: u64) {
        let now = if now_ns == 0 { monotonic_now_ns() } else { now_ns };
        let drops = self.events_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        self.bytes_dropped
            .fetch_add(dropped_bytes as u64, Ordering::Relaxed);
        self.last_drop_ns.store(now, Ordering::Relaxed);
        if !self.sequence_open.swap(true, Ordering::Relaxed) {
            self.drop_sequences.fetch_add(1, Ordering::Relaxed);
        }

        let interval = self.config.drop_log_interval;
        if interval != 0 && drops % u64::from(interval) == 0 {
            info!(
                "backpressure drops:{} bytes:{} sequences:{} mode:{} free:{}/{} low:{}",
                drops,
                self.bytes_dropped.load(Ordering::Relaxed),
                self.drop_sequences.load(Ordering::Relaxed),
                self.mode().as_str(),
                self.free_rings.load(Ordering::Relaxed),
                self.total_rings.load(Ordering::Relaxed),
                self.low_watermark(),
            );
        }
    }

    /// Capacity returned to the pool; lifts DROPPING into RECOVERY.
    pub fn on_recovery(&self, free_rings: u32, now_ns: u64) {
        let now = if now_ns == 0 { monotonic_now_ns() } else { now_ns };
        self.free_rings.store(free_rings, Ordering::Relaxed);
        self.last_recovery_ns.store(now, Ordering::Relaxed);
        if self.mode() == BackpressureMode::Dropping {
            self.transition(BackpressureMode::Dropping, BackpressureMode::Recovery, now);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> BackpressureSnapshot {
        BackpressureSnapshot {
            mode: self.mode(),
            transitions: self.transitions.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            drop_sequences: self.drop_sequences.load(Ordering::Relaxed),
            free_rings: self.free_rings.load(Ordering::Relaxed),
            total_rings: self.total_rings.load(Ordering::Relaxed),
            low_watermark: self.low_watermark(),
            last_drop_ns: self.last_drop_ns.load(Ordering::Relaxed),
            last_recovery_ns: self.last_recovery_ns.load(Ordering::Relaxed),
            pressure_start_ns: self.pressure_start_ns.load(Ordering::Relaxed),
        }
    }
}
