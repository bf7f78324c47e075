use std::sync::atomic::{AtomicU32, Ordering};

use capros_store::PageBuf;
use capros_types::{BaseType, ObCount, ObType, ObjectFlags, Oid, OidRange};
use tracing::debug;

use crate::cache::ObjectCache;
use crate::error::CacheResult;
use crate::header::FrameId;
use crate::physmem::{phys_frame, phys_oid, PhysMem, PmemKind};
use crate::traits::ObjectSource;

/// Exposes physical page frames as page objects.
///
/// The OID of physical frame `f` is `OID_RESERVED_PHYSRANGE + f * 256`.
/// All physical pages share one allocation count; bumping it with
/// [`PhysPageSource::invalidate`] makes every outstanding capability stale.
pub struct PhysPageSource {
    pmem: PhysMem,
    range: OidRange,
    alloc_count: AtomicU32,
}

impl PhysPageSource {
    pub fn new(pmem: PhysMem) -> CacheResult<Self> {
        let start = pmem.regions().first().map(|r| r.base_frame).unwrap_or(0);
        let end = pmem
            .regions()
            .iter()
            .map(|r| r.base_frame + r.n_frames)
            .max()
            .unwrap_or(0);
        let range = OidRange::new(phys_oid(start), phys_oid(end))?;
        Ok(Self {
            pmem,
            range,
            alloc_count: AtomicU32::new(0),
        })
    }

    pub fn range(&self) -> OidRange {
        self.range
    }

    pub fn alloc_count(&self) -> ObCount {
        self.alloc_count.load(Ordering::Relaxed)
    }

    /// Withdraw the physical page `oid`: outstanding capabilities go stale
    /// and the frame is released. Returns whether it was resident.
    pub fn invalidate(&self, cache: &mut ObjectCache, oid: Oid) -> bool {
        let count = self.alloc_count.fetch_add(1, Ordering::Relaxed) + 1;
        let resident = cache.lookup(ObType::PtDataPage, oid);
        if let Some(frame) = resident {
            cache.release_frame(frame);
        }
        debug!(%oid, alloc_count = count, resident = resident.is_some(), "invalidated physical page");
        resident.is_some()
    }
}

impl ObjectSource for PhysPageSource {
    fn name(&self) -> &'static str {
        "physical pages"
    }

    fn get_object(
        &self,
        cache: &mut ObjectCache,
        oid: Oid,
        base: BaseType,
        count: ObCount,
        use_count: bool,
    ) -> CacheResult<Option<FrameId>> {
        if base != BaseType::Page {
            return Ok(None);
        }
        let Some(phys) = phys_frame(oid) else {
            return Ok(None);
        };
        let Some(region) = self.pmem.region_for(phys) else {
            debug!(%oid, phys, "physical frame outside memory map");
            return Ok(None);
        };
        let alloc_count = self.alloc_count();
        if use_count && count != alloc_count {
            return Ok(None);
        }

        let frame = cache.claim_phys_frame(phys)?;
        let (ob_type, flags) = match region.kind {
            PmemKind::Ram => (ObType::PtDataPage, ObjectFlags::empty()),
            PmemKind::Device | PmemKind::Rom => (ObType::PtDevicePage, ObjectFlags::DIRTY),
        };
        cache.install_page(frame, oid, alloc_count, ob_type, PageBuf::zeroed(), flags)?;
        Ok(Some(frame))
    }

    fn write_back(&self, _cache: &mut ObjectCache, _frame: FrameId) -> CacheResult<bool> {
        Ok(false)
    }

    /// Only frames inside a memory region are backed.
    fn implemented_subrange(&self, claimed: OidRange, query: OidRange) -> Option<OidRange> {
        let query = claimed.intersect(&query)?;
        self.pmem
            .regions()
            .iter()
            .find_map(|r| r.oid_range().intersect(&query))
    }
}
