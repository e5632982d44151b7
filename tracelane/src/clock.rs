//! Process-wide monotonic nanosecond clock.
//!
//! Event timestamps, backpressure timing, and the manifest's monotonic
//! range all come from this single anchor so they are comparable within a
//! session.

use std::sync::OnceLock;
use std::time::Instant;

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since the first call in this process.
#[must_use]
pub fn monotonic_now_ns() -> u64 {
    let anchor = ANCHOR.get_or_init(Instant::now);
    u64::try_from(anchor.elapsed().as_nanos()).unwrap_or(u64::MAX)
}
