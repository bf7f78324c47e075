use serde::{Deserialize, Serialize};

use capros_types::{Oid, OidRange, OBJECTS_PER_FRAME, OID_RESERVED_PHYSRANGE};

use crate::error::{CacheError, CacheResult};

/// What a physical memory region holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PmemKind {
    Ram,
    Device,
    Rom,
}

/// One contiguous region of physical page frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmemInfo {
    pub base_frame: u64,
    pub n_frames: u64,
    pub kind: PmemKind,
}

impl PmemInfo {
    pub fn ram(base_frame: u64, n_frames: u64) -> Self {
        Self {
            base_frame,
            n_frames,
            kind: PmemKind::Ram,
        }
    }

    pub fn device(base_frame: u64, n_frames: u64) -> Self {
        Self {
            base_frame,
            n_frames,
            kind: PmemKind::Device,
        }
    }

    pub fn contains(&self, frame: u64) -> bool {
        frame >= self.base_frame && frame < self.base_frame + self.n_frames
    }

    pub fn frames(&self) -> impl Iterator<Item = u64> {
        self.base_frame..self.base_frame + self.n_frames
    }

    /// The physical-range OIDs naming this region's frames.
    pub fn oid_range(&self) -> OidRange {
        OidRange {
            start: phys_oid(self.base_frame),
            end: phys_oid(self.base_frame + self.n_frames),
        }
    }
}

/// OID naming physical frame `frame`.
pub fn phys_oid(frame: u64) -> Oid {
    OID_RESERVED_PHYSRANGE.add_frames(frame)
}

/// Physical frame named by a physical-range OID.
pub fn phys_frame(oid: Oid) -> Option<u64> {
    if !oid.is_physical() || oid.index() != 0 {
        return None;
    }
    Some((oid.0 - OID_RESERVED_PHYSRANGE.0) / OBJECTS_PER_FRAME)
}

/// Physical memory map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysMem {
    regions: Vec<PmemInfo>,
}

impl PhysMem {
    /// Regions are kept sorted by base frame; empty regions are dropped.
    /// Regions that share a frame are rejected.
    pub fn new(mut regions: Vec<PmemInfo>) -> CacheResult<Self> {
        regions.retain(|r| r.n_frames > 0);
        regions.sort_by_key(|r| r.base_frame);
        for pair in regions.windows(2) {
            if pair[1].base_frame < pair[0].base_frame + pair[0].n_frames {
                return Err(CacheError::RangeOverlap {
                    new: pair[1].oid_range(),
                    existing: pair[0].oid_range(),
                });
            }
        }
        Ok(Self { regions })
    }

    /// A map with a single RAM region of `n_frames` starting at frame 0.
    pub fn ram_only(n_frames: u64) -> Self {
        let regions = if n_frames > 0 {
            vec![PmemInfo::ram(0, n_frames)]
        } else {
            Vec::new()
        };
        Self { regions }
    }

    pub fn regions(&self) -> &[PmemInfo] {
        &self.regions
    }

    pub fn region_for(&self, frame: u64) -> Option<&PmemInfo> {
        self.regions.iter().find(|r| r.contains(frame))
    }

    pub fn ram_frames(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.kind == PmemKind::Ram)
            .map(|r| r.n_frames)
            .sum()
    }

    /// Every frame in every region, in address order.
    pub fn all_frames(&self) -> impl Iterator<Item = (u64, PmemKind)> + '_ {
        self.regions
            .iter()
            .flat_map(|r| r.frames().map(move |f| (f, r.kind)))
    }
}
