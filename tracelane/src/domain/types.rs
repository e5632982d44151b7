//! Core domain newtypes.

use std::fmt;

/// Index of a thread's slot in the registry. Stable for the thread's
/// lifetime within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(pub u32);

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot:{}", self.0)
    }
}

impl SlotIndex {
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Identifier of one bounded tracing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{:016x}", self.0)
    }
}

/// The two event streams every registered thread owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneKind {
    /// Fixed 32-byte call/return skeleton events.
    Index,
    /// Large-payload events carrying register and stack snapshots.
    Detail,
}

impl LaneKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LaneKind::Index => "index",
            LaneKind::Detail => "detail",
        }
    }
}

impl fmt::Display for LaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When the drain persists a drained detail ring.
///
/// `Marked` realizes retrospective capture: every detail event is captured
/// in memory, but only rings containing a marked record reach disk. It is
/// never enabled implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetailPersistence {
    #[default]
    Always,
    Marked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_index_display() {
        assert_eq!(SlotIndex(7).to_string(), "slot:7");
    }

    #[test]
    fn lane_kind_names() {
        assert_eq!(LaneKind::Index.as_str(), "index");
        assert_eq!(LaneKind::Detail.to_string(), "detail");
    }
}
