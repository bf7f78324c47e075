use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::oid::OBJECTS_PER_FRAME;

/// Generation number. Generation 0 is never written; the preloaded big bang
/// starts at generation 1.
pub type GenNum = u64;

/// Largest LID representable in the 28-bit in-core form.
pub const MAX_LID_VALUE: u32 = 0x0fff_ffff;

/// Location of an object version in the checkpoint log.
///
/// Like an OID, a LID is `frame << 8 | index`: pages live at index 0 of
/// their frame, nodes at their slot within a node pot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Lid(u32);

/// The object is entirely zero; no log frame holds it.
pub const ZERO_LID: Lid = Lid(0);

/// The object has not been located yet.
pub const UNDEF_LID: Lid = Lid(1);

/// First of the two alternating checkpoint anchors.
pub const CKPT_ROOT_0: Lid = Lid(0x100);

/// Second of the two alternating checkpoint anchors.
pub const CKPT_ROOT_1: Lid = Lid(0x200);

/// First frame of the circular main log.
pub const MAIN_LOG_START: Lid = Lid(0x300);

impl Lid {
    /// Build a LID, rejecting values that do not fit in 28 bits.
    pub fn new(raw: u32) -> Result<Self, TypeError> {
        if raw > MAX_LID_VALUE {
            return Err(TypeError::LidOutOfRange(raw as u64));
        }
        Ok(Self(raw))
    }

    /// LID of index 0 of the given log frame.
    pub fn from_frame(frame: u32) -> Result<Self, TypeError> {
        let raw = frame as u64 * OBJECTS_PER_FRAME;
        if raw > MAX_LID_VALUE as u64 {
            return Err(TypeError::LidOutOfRange(raw));
        }
        Ok(Self(raw as u32))
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn frame(self) -> u32 {
        self.0 / OBJECTS_PER_FRAME as u32
    }

    pub const fn index(self) -> u8 {
        (self.0 % OBJECTS_PER_FRAME as u32) as u8
    }

    /// The LID of the object at `index` within this LID's frame.
    pub const fn with_index(self, index: u8) -> Self {
        Self(self.0 - self.0 % OBJECTS_PER_FRAME as u32 + index as u32)
    }

    /// LID of the following frame (no wrap handling).
    pub const fn next_frame(self) -> Self {
        Self((self.frame() + 1) * OBJECTS_PER_FRAME as u32)
    }

    /// True when the LID designates real log content rather than a sentinel.
    pub const fn is_content(self) -> bool {
        self.0 >= OBJECTS_PER_FRAME as u32
    }

    /// The anchor slot that is not `self`.
    pub fn other_root(self) -> Self {
        Lid(self.0 ^ (CKPT_ROOT_0.0 ^ CKPT_ROOT_1.0))
    }
}

impl fmt::Debug for Lid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ZERO_LID => write!(f, "Lid(ZERO)"),
            UNDEF_LID => write!(f, "Lid(UNDEF)"),
            _ => write!(f, "Lid({:#x})", self.0),
        }
    }
}

impl fmt::Display for Lid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// What a packed on-disk LID points at (the 4-bit type nibble).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LidTag {
    ObjectDir,
    ThreadDir,
    ReserveDir,
    GenerationHdr,
    NodePot,
    Page,
}

impl LidTag {
    pub fn nibble(self) -> u8 {
        match self {
            Self::ObjectDir => 0,
            Self::ThreadDir => 1,
            Self::ReserveDir => 2,
            Self::GenerationHdr => 3,
            Self::NodePot => 4,
            Self::Page => 5,
        }
    }

    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(Self::ObjectDir),
            1 => Some(Self::ThreadDir),
            2 => Some(Self::ReserveDir),
            3 => Some(Self::GenerationHdr),
            4 => Some(Self::NodePot),
            5 => Some(Self::Page),
            _ => None,
        }
    }
}

/// On-disk `lid_t`: a 28-bit LID with a 4-bit tag in the top nibble.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackedLid {
    pub lid: Lid,
    pub tag: LidTag,
}

impl PackedLid {
    pub fn new(lid: Lid, tag: LidTag) -> Self {
        Self { lid, tag }
    }

    pub fn to_u32(self) -> u32 {
        self.lid.raw() | ((self.tag.nibble() as u32) << 28)
    }

    pub fn from_u32(word: u32) -> Result<Self, TypeError> {
        let nibble = (word >> 28) as u8;
        let tag = LidTag::from_nibble(nibble).ok_or(TypeError::UnknownLidTag(nibble))?;
        Ok(Self {
            lid: Lid(word & MAX_LID_VALUE),
            tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_not_content() {
        assert!(!ZERO_LID.is_content());
        assert!(!UNDEF_LID.is_content());
        assert!(CKPT_ROOT_0.is_content());
        assert!(MAIN_LOG_START.is_content());
    }

    #[test]
    fn frame_arithmetic() {
        let lid = Lid::from_frame(7).unwrap();
        assert_eq!(lid.raw(), 0x700);
        assert_eq!(lid.frame(), 7);
        assert_eq!(lid.with_index(3).raw(), 0x703);
        assert_eq!(lid.with_index(3).frame(), 7);
        assert_eq!(lid.with_index(3).next_frame(), Lid::from_frame(8).unwrap());
    }

    #[test]
    fn root_toggle() {
        assert_eq!(CKPT_ROOT_0.other_root(), CKPT_ROOT_1);
        assert_eq!(CKPT_ROOT_1.other_root(), CKPT_ROOT_0);
    }

    #[test]
    fn rejects_wide_lids() {
        assert!(Lid::new(MAX_LID_VALUE).is_ok());
        assert_eq!(
            Lid::new(MAX_LID_VALUE + 1),
            Err(TypeError::LidOutOfRange(MAX_LID_VALUE as u64 + 1))
        );
        assert!(Lid::from_frame(1 << 20).is_err());
    }

    #[test]
    fn packed_lid_keeps_tag_in_top_nibble() {
        let packed = PackedLid::new(Lid::new(0x0abc_de00).unwrap(), LidTag::ThreadDir);
        let word = packed.to_u32();
        assert_eq!(word >> 28, 1);
        assert_eq!(word & MAX_LID_VALUE, 0x0abc_de00);
        assert_eq!(PackedLid::from_u32(word).unwrap(), packed);
    }

    #[test]
    fn packed_lid_rejects_unknown_tag() {
        assert!(PackedLid::from_u32(0xf000_0100).is_err());
    }
}
