use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// The two kinds of object a capability can designate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BaseType {
    Page,
    Node,
}

impl BaseType {
    /// Four-bit tag used in directory entries.
    pub fn nibble(self) -> u8 {
        match self {
            Self::Page => 0,
            Self::Node => 1,
        }
    }

    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(Self::Page),
            1 => Some(Self::Node),
            _ => None,
        }
    }

    /// The type a freshly fetched object of this base type carries.
    pub fn fetched_type(self) -> ObType {
        match self {
            Self::Page => ObType::PtDataPage,
            Self::Node => ObType::NtUnprepared,
        }
    }
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Page => write!(f, "page"),
            Self::Node => write!(f, "node"),
        }
    }
}

/// Type tag of an in-core frame.
///
/// Node frames carry `Nt*` tags, page frames `Pt*` tags. Several node
/// subtypes describe how a node is currently prepared; lookups treat them
/// all as [`ObType::NtUnprepared`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObType {
    NtUnprepared,
    NtSegment,
    NtProcessRoot,
    NtKeyRegs,
    NtRegAnnex,
    /// Frozen checkpoint copy of a node that was mutated after demarcation.
    NtWorkingCopy,
    NtFreeFrame,
    PtDataPage,
    /// Frame taken from the free list and not yet typed.
    PtNewAlloc,
    PtKernelUse,
    PtDevicePage,
    PtTagPot,
    PtHomePot,
    PtLogPot,
    PtDmaBlock,
    PtDmaSecondary,
    /// Frozen checkpoint copy of a page that was mutated after demarcation.
    PtWorkingCopy,
    PtFreeFrame,
    PtSecondary,
}

impl ObType {
    /// Collapse prepared node subtypes and device pages to the type used
    /// when comparing against a lookup request.
    pub fn canonical(self) -> ObType {
        match self {
            Self::NtSegment | Self::NtProcessRoot | Self::NtKeyRegs | Self::NtRegAnnex => {
                Self::NtUnprepared
            }
            Self::PtDevicePage => Self::PtDataPage,
            other => other,
        }
    }

    pub fn is_node(self) -> bool {
        matches!(
            self,
            Self::NtUnprepared
                | Self::NtSegment
                | Self::NtProcessRoot
                | Self::NtKeyRegs
                | Self::NtRegAnnex
                | Self::NtWorkingCopy
                | Self::NtFreeFrame
        )
    }

    pub fn is_free(self) -> bool {
        matches!(self, Self::NtFreeFrame | Self::PtFreeFrame)
    }

    /// The capability-visible base type, for object-bearing frames only.
    pub fn base_type(self) -> Option<BaseType> {
        match self.canonical() {
            Self::NtUnprepared => Some(BaseType::Node),
            Self::PtDataPage => Some(BaseType::Page),
            _ => None,
        }
    }

    /// Whether this frame can be reclaimed by the aging scan.
    pub fn is_ageable(self) -> bool {
        matches!(
            self,
            Self::PtDataPage | Self::PtTagPot | Self::PtHomePot | Self::PtLogPot
        ) || self.base_type() == Some(BaseType::Node)
    }
}

impl fmt::Display for ObType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-object state bits.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectFlags(u8);

impl ObjectFlags {
    pub const DIRTY: Self = Self(0x01);
    /// Dirtied again while a write-back was in flight.
    pub const REDIRTY: Self = Self(0x02);
    /// Eligible for write-back (persistent objects only).
    pub const CLEANABLE: Self = Self(0x04);
    pub const CURRENT: Self = Self(0x08);
    /// Frozen for the in-flight checkpoint; mutation must copy first.
    pub const CKPT: Self = Self(0x10);
    pub const IO: Self = Self(0x20);
    pub const CALL_CNT_USED: Self = Self(0x40);
    pub const ALLOC_CNT_USED: Self = Self(0x80);

    const NAMES: [(ObjectFlags, &'static str); 8] = [
        (Self::DIRTY, "DIRTY"),
        (Self::REDIRTY, "REDIRTY"),
        (Self::CLEANABLE, "CLEANABLE"),
        (Self::CURRENT, "CURRENT"),
        (Self::CKPT, "CKPT"),
        (Self::IO, "IO"),
        (Self::CALL_CNT_USED, "CALL_CNT_USED"),
        (Self::ALLOC_CNT_USED, "ALLOC_CNT_USED"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ObjectFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ObjectFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ObjectFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "ObjectFlags({})", names.join("|"))
    }
}

/// Eviction age. Referencing an object resets it to [`Age::NEW_BORN`]; the
/// aging scan bumps it until the frame is stolen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Age(u8);

impl Age {
    pub const NEW_BORN: Age = Age(0);
    /// Prepared capabilities are dropped so later references are noticed.
    pub const INVALIDATE: Age = Age(4);
    /// Dirty objects are written back.
    pub const CLEAN: Age = Age(6);
    /// The frame is reclaimed.
    pub const STEAL: Age = Age(7);

    pub const fn value(self) -> u8 {
        self.0
    }

    pub fn bump(&mut self) {
        if self.0 < Self::STEAL.0 {
            self.0 += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_collapses_node_subtypes() {
        for ty in [
            ObType::NtSegment,
            ObType::NtProcessRoot,
            ObType::NtKeyRegs,
            ObType::NtRegAnnex,
        ] {
            assert_eq!(ty.canonical(), ObType::NtUnprepared);
            assert_eq!(ty.base_type(), Some(BaseType::Node));
        }
    }

    #[test]
    fn canonical_collapses_device_pages() {
        assert_eq!(ObType::PtDevicePage.canonical(), ObType::PtDataPage);
        assert_eq!(ObType::PtDevicePage.base_type(), Some(BaseType::Page));
    }

    #[test]
    fn non_object_frames_have_no_base_type() {
        assert_eq!(ObType::PtFreeFrame.base_type(), None);
        assert_eq!(ObType::PtWorkingCopy.base_type(), None);
        assert_eq!(ObType::NtWorkingCopy.base_type(), None);
        assert_eq!(ObType::PtLogPot.base_type(), None);
    }

    #[test]
    fn flags_set_and_clear() {
        let mut flags = ObjectFlags::CURRENT | ObjectFlags::DIRTY;
        assert!(flags.contains(ObjectFlags::DIRTY));
        flags.remove(ObjectFlags::DIRTY);
        assert!(!flags.contains(ObjectFlags::DIRTY));
        assert!(flags.contains(ObjectFlags::CURRENT));
        flags.set(ObjectFlags::CKPT, true);
        assert!(flags.intersects(ObjectFlags::CKPT | ObjectFlags::IO));
        assert_eq!(format!("{flags:?}"), "ObjectFlags(CURRENT|CKPT)");
    }

    #[test]
    fn age_saturates_at_steal() {
        let mut age = Age::CLEAN;
        age.bump();
        assert_eq!(age, Age::STEAL);
        age.bump();
        assert_eq!(age, Age::STEAL);
    }

    #[test]
    fn base_type_nibbles() {
        assert_eq!(BaseType::from_nibble(BaseType::Node.nibble()), Some(BaseType::Node));
        assert_eq!(BaseType::from_nibble(9), None);
    }
}
