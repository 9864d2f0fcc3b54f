use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

use crate::NodeId;

/// Epoch categories carried in the id itself.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpochCategory {
    Plain = 0,
    /// Messages under the epoch wait at their element until the epoch is
    /// released there.
    Dependent = 1,
}

/// A 64-bit epoch id.
///
/// - bit 63: rooted
/// - bits 61-62: category
/// - bits 32-60: root node (rooted epochs only)
/// - bits 0-31: sequence number
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Archive, Serialize, Deserialize,
)]
#[archive(check_bytes)]
pub struct EpochId(u64);

const ROOTED_BIT: u64 = 1 << 63;
const CATEGORY_SHIFT: u64 = 61;
const NODE_SHIFT: u64 = 32;
const NODE_MASK: u64 = (1 << 29) - 1;

impl EpochId {
    /// The epoch every tracked message belongs to. Terminates at finalize.
    pub const GLOBAL: EpochId = EpochId(0);

    pub(crate) fn collective(seq: u32) -> Self {
        Self(seq as u64)
    }

    pub(crate) fn rooted(root: NodeId, seq: u32, category: EpochCategory) -> Self {
        Self(
            ROOTED_BIT
                | ((category as u64) << CATEGORY_SHIFT)
                | ((root as u64 & NODE_MASK) << NODE_SHIFT)
                | seq as u64,
        )
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_rooted(&self) -> bool {
        self.0 & ROOTED_BIT != 0
    }

    pub fn is_global(&self) -> bool {
        *self == Self::GLOBAL
    }

    /// The owning node of a rooted epoch.
    pub fn root(&self) -> Option<NodeId> {
        self.is_rooted()
            .then(|| ((self.0 >> NODE_SHIFT) & NODE_MASK) as NodeId)
    }

    pub fn category(&self) -> EpochCategory {
        match (self.0 >> CATEGORY_SHIFT) & 0b11 {
            1 => EpochCategory::Dependent,
            _ => EpochCategory::Plain,
        }
    }

    pub fn is_dependent(&self) -> bool {
        self.category() == EpochCategory::Dependent
    }

    pub fn seq(&self) -> u32 {
        self.0 as u32
    }

    /// The control bits alone: every epoch of one kind, root and category
    /// shares them.
    pub(crate) fn archetype(&self) -> u64 {
        self.0 & !(u32::MAX as u64)
    }
}

impl fmt::Debug for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.root() {
            Some(root) => write!(f, "{:x}@{}", self.0, root),
            None => write!(f, "{:x}", self.0),
        }
    }
}
