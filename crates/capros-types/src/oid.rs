use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Number of object identifiers covered by one page frame.
pub const OBJECTS_PER_FRAME: u64 = 256;

/// Size in bytes of one page (and one log frame).
pub const PAGE_SIZE: usize = 4096;

/// Number of key slots in a node.
pub const NODE_SIZE: usize = 32;

/// OIDs below this value are non-persistent (preloaded, rebuilt each boot).
pub const FIRST_PERSISTENT_OID: Oid = Oid(0x1000);

/// Start of the range that names raw physical page frames.
pub const OID_RESERVED_PHYSRANGE: Oid = Oid(0xff00_0000_0000_0000);

/// Allocation / call count carried by every object and every capability.
pub type ObCount = u32;

/// Persistent 64-bit object identifier.
///
/// The high 56 bits select a frame and the low 8 bits an object within it.
/// Pages always sit at index 0; nodes may use any index.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Oid(pub u64);

impl Oid {
    /// Build an OID from a frame number and an index within the frame.
    pub const fn from_frame(frame: u64, index: u8) -> Self {
        Self(frame * OBJECTS_PER_FRAME + index as u64)
    }

    pub const fn frame(self) -> u64 {
        self.0 / OBJECTS_PER_FRAME
    }

    pub const fn index(self) -> u8 {
        (self.0 % OBJECTS_PER_FRAME) as u8
    }

    /// True for OIDs whose objects survive restart.
    pub fn is_persistent(self) -> bool {
        self >= FIRST_PERSISTENT_OID && self < OID_RESERVED_PHYSRANGE
    }

    /// True for OIDs naming raw physical frames.
    pub fn is_physical(self) -> bool {
        self >= OID_RESERVED_PHYSRANGE
    }

    /// The OID `frames` frames after this one.
    pub fn add_frames(self, frames: u64) -> Self {
        Self(self.0 + frames * OBJECTS_PER_FRAME)
    }

    /// Parse `0x`-prefixed hex or plain decimal.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
            None => s.replace('_', "").parse::<u64>(),
        };
        parsed
            .map(Oid)
            .map_err(|_| TypeError::InvalidOid(s.to_string()))
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({:#x})", self.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Half-open OID interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OidRange {
    pub start: Oid,
    pub end: Oid,
}

impl OidRange {
    /// Create a non-empty range.
    pub fn new(start: Oid, end: Oid) -> Result<Self, TypeError> {
        if end <= start {
            return Err(TypeError::EmptyRange {
                start: start.0,
                end: end.0,
            });
        }
        Ok(Self { start, end })
    }

    /// Range covering `frames` whole frames starting at `start`.
    pub fn frames(start: Oid, frames: u64) -> Result<Self, TypeError> {
        Self::new(start, start.add_frames(frames))
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.start <= oid && oid < self.end
    }

    pub fn overlaps(&self, other: &OidRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The intersection with `other`, or `None` when they are disjoint.
    pub fn intersect(&self, other: &OidRange) -> Option<OidRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(OidRange { start, end })
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for OidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
