use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Coordinate in the commitlog totally ordering writes within a shard.
///
/// A replay position names the commitlog segment a mutation landed in and the
/// byte offset of its entry inside that segment. Positions are handed out by
/// the commitlog collaborator and are strictly increasing for consecutive
/// appends on the same shard.
///
/// # Properties
///
/// - **Monotonic**: every append receives a position greater than any
///   position previously assigned on the shard
/// - **Opaque**: the engine only compares positions, it never derives
///   anything from their components
/// - **Zero element**: [`ReplayPosition::ZERO`] compares strictly less than
///   any position assigned to a real mutation
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ReplayPosition {
    /// Commitlog segment the entry was appended to.
    pub segment: u64,
    /// Byte offset of the entry within the segment.
    pub offset: u32,
}

impl ReplayPosition {
    /// Position smaller than any assigned position. A memtable carries this
    /// position exactly when it holds no logged mutation.
    pub const ZERO: ReplayPosition = ReplayPosition {
        segment: 0,
        offset: 0,
    };

    #[inline]
    pub const fn new(segment: u64, offset: u32) -> Self {
        Self { segment, offset }
    }

    /// Returns true for the zero element.
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.segment == 0 && self.offset == 0
    }
}

impl Display for ReplayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}
