use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use capros_store::{NodeData, PageBuf};
use capros_types::{Age, BaseType, ObCount, ObType, ObjectFlags, Oid, OidRange};
use tracing::{debug, trace, warn};

use crate::checksum::page_checksum;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::hash::ObjectHash;
use crate::header::{FrameId, ObjectBody, ObjectHeader};
use crate::keyring::{HolderId, KeyRing};
use crate::physmem::{PhysMem, PmemKind};
use crate::traits::ObjectSource;

/// An OID range and the source that owns it.
#[derive(Clone)]
pub struct ObjectRange {
    pub range: OidRange,
    pub source: Arc<dyn ObjectSource>,
}

impl std::fmt::Debug for ObjectRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRange")
            .field("range", &self.range)
            .field("source", &self.source.name())
            .finish()
    }
}

/// The resident object set.
///
/// Owns every frame header, the object hash, the key ring and the registered
/// source ranges. Page frames are laid out first (one per physical frame),
/// node frames after them.
pub struct ObjectCache {
    config: CacheConfig,
    headers: Vec<ObjectHeader>,
    n_page_frames: u32,
    hash: ObjectHash,
    keyring: KeyRing,
    pmem: PhysMem,
    phys_index: HashMap<u64, FrameId>,
    free_pages: BTreeSet<FrameId>,
    free_nodes: BTreeSet<FrameId>,
    /// Sorted by start, never overlapping.
    ranges: Vec<ObjectRange>,
    page_cursor: u32,
    node_cursor: u32,
    checkpoint_active: bool,
}

impl ObjectCache {
    pub fn new(config: CacheConfig, pmem: PhysMem) -> Self {
        let mut headers = Vec::new();
        let mut phys_index = HashMap::new();
        let mut free_pages = BTreeSet::new();
        for (phys, kind) in pmem.all_frames() {
            let id = FrameId(headers.len() as u32);
            headers.push(ObjectHeader::free_page(phys));
            phys_index.insert(phys, id);
            if kind == PmemKind::Ram {
                free_pages.insert(id);
            }
        }
        let n_page_frames = headers.len() as u32;
        let mut free_nodes = BTreeSet::new();
        for _ in 0..config.node_frames {
            free_nodes.insert(FrameId(headers.len() as u32));
            headers.push(ObjectHeader::free_node());
        }
        debug!(
            page_frames = n_page_frames,
            ram_frames = free_pages.len(),
            node_frames = config.node_frames,
            "object cache initialized"
        );

        Self {
            hash: ObjectHash::new(config.hash_buckets),
            config,
            headers,
            n_page_frames,
            keyring: KeyRing::new(),
            pmem,
            phys_index,
            free_pages,
            free_nodes,
            ranges: Vec::new(),
            page_cursor: 0,
            node_cursor: 0,
            checkpoint_active: false,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn pmem(&self) -> &PhysMem {
        &self.pmem
    }

    pub fn hash(&self) -> &ObjectHash {
        &self.hash
    }

    pub fn keyring(&self) -> &KeyRing {
        &self.keyring
    }

    pub fn frame_count(&self) -> usize {
        self.headers.len()
    }

    pub fn free_page_count(&self) -> usize {
        self.free_pages.len()
    }

    pub fn free_node_count(&self) -> usize {
        self.free_nodes.len()
    }

    pub(crate) fn is_free_listed(&self, frame: FrameId) -> bool {
        self.free_pages.contains(&frame) || self.free_nodes.contains(&frame)
    }

    pub(crate) fn arena(&self) -> &[ObjectHeader] {
        &self.headers
    }

    fn check_frame(&self, frame: FrameId) -> CacheResult<()> {
        if frame.index() >= self.headers.len() {
            return Err(CacheError::NoSuchFrame(frame));
        }
        Ok(())
    }

    /// Header of a frame handed out by this cache.
    pub fn header(&self, frame: FrameId) -> &ObjectHeader {
        &self.headers[frame.index()]
    }

    /// Mutable header access. Changing `oid` or `ob_type` of an interned
    /// object corrupts the hash; use the install and release operations.
    pub fn header_mut(&mut self, frame: FrameId) -> &mut ObjectHeader {
        &mut self.headers[frame.index()]
    }

    pub fn frames(&self) -> impl Iterator<Item = (FrameId, &ObjectHeader)> {
        self.headers
            .iter()
            .enumerate()
            .map(|(i, hdr)| (FrameId(i as u32), hdr))
    }

    /// The page frame backing physical frame `phys`, if it is in the map.
    pub fn frame_for_phys(&self, phys: u64) -> Option<FrameId> {
        self.phys_index.get(&phys).copied()
    }

    // Source ranges

    /// Register `source` as the owner of `range`.
    pub fn add_range(&mut self, range: OidRange, source: Arc<dyn ObjectSource>) -> CacheResult<()> {
        if let Some(existing) = self.ranges.iter().find(|r| r.range.overlaps(&range)) {
            return Err(CacheError::RangeOverlap {
                new: range,
                existing: existing.range,
            });
        }
        let at = self.ranges.partition_point(|r| r.range.start < range.start);
        debug!(%range, source = source.name(), "registered object range");
        self.ranges.insert(at, ObjectRange { range, source });
        Ok(())
    }

    pub fn ranges(&self) -> &[ObjectRange] {
        &self.ranges
    }

    pub fn source_for(&self, oid: Oid) -> Option<Arc<dyn ObjectSource>> {
        self.ranges
            .iter()
            .find(|r| r.range.contains(oid))
            .map(|r| Arc::clone(&r.source))
    }

    /// The lowest sub-range of `query` that some source actually backs.
    pub fn find_first_subrange(&self, query: OidRange) -> Option<OidRange> {
        self.ranges.iter().find_map(|r| {
            let clipped = r.range.intersect(&query)?;
            r.source.implemented_subrange(r.range, clipped)
        })
    }

    // Lookup and fetch

    /// Resident object lookup; a hit resets the object's age.
    pub fn lookup(&mut self, ty: ObType, oid: Oid) -> Option<FrameId> {
        self.hash.lookup(&mut self.headers, ty, oid)
    }

    /// Bring `oid` into the cache as an object of type `base`.
    ///
    /// Returns `Ok(None)` when `use_count` is set and the object's
    /// allocation count is not `count`, or when the OID is resident as the
    /// other base type.
    pub fn get_object(
        &mut self,
        oid: Oid,
        base: BaseType,
        count: ObCount,
        use_count: bool,
    ) -> CacheResult<Option<FrameId>> {
        let frame = match self.lookup(base.fetched_type(), oid) {
            Some(frame) => {
                self.verify_checksum(frame)?;
                Some(frame)
            }
            None => {
                let other = match base {
                    BaseType::Page => BaseType::Node,
                    BaseType::Node => BaseType::Page,
                };
                if self
                    .hash
                    .find(&self.headers, other.fetched_type(), oid)
                    .is_some()
                {
                    debug!(%oid, requested = %base, "object resident as other type");
                    return Ok(None);
                }
                let source = self.source_for(oid).ok_or(CacheError::NoSource(oid))?;
                source.get_object(self, oid, base, count, use_count)?
            }
        };

        let Some(frame) = frame else {
            return Ok(None);
        };
        let hdr = &mut self.headers[frame.index()];
        hdr.age = Age::NEW_BORN;
        if use_count && hdr.alloc_count != count {
            debug!(%oid, have = hdr.alloc_count, want = count, "stale allocation count");
            return Ok(None);
        }
        Ok(Some(frame))
    }

    /// Recompute a clean page's checksum and compare.
    pub fn verify_checksum(&self, frame: FrameId) -> CacheResult<()> {
        let hdr = &self.headers[frame.index()];
        if !self.config.checksums || hdr.is_dirty() || hdr.ob_type == ObType::PtDevicePage {
            return Ok(());
        }
        let (Some(expected), Some(page)) = (hdr.checksum, hdr.page()) else {
            return Ok(());
        };
        let actual = page_checksum(page);
        if actual != expected {
            warn!(oid = %hdr.oid, expected, actual, "page checksum mismatch");
            return Err(CacheError::ChecksumMismatch {
                oid: hdr.oid,
                expected,
                actual,
            });
        }
        Ok(())
    }

    // Frame management

    /// Take a free page frame, aging page frames if none is free.
    pub fn grab_page_frame(&mut self) -> CacheResult<FrameId> {
        if self.free_pages.is_empty() {
            self.age_page_frames()?;
        }
        let frame = self
            .free_pages
            .pop_first()
            .ok_or(CacheError::AllFramesStuck {
                kind: "page",
                stuck: self.n_page_frames as usize,
                pinned: 0,
            })?;
        self.headers[frame.index()].ob_type = ObType::PtNewAlloc;
        Ok(frame)
    }

    /// Take a free node frame, aging node frames if none is free.
    pub fn grab_node_frame(&mut self) -> CacheResult<FrameId> {
        if self.free_nodes.is_empty() {
            self.age_node_frames()?;
        }
        self.free_nodes
            .pop_first()
            .ok_or(CacheError::AllFramesStuck {
                kind: "node",
                stuck: self.config.node_frames as usize,
                pinned: 0,
            })
    }

    /// Take the page frame of physical frame `phys`, evicting its occupant.
    pub fn claim_phys_frame(&mut self, phys: u64) -> CacheResult<FrameId> {
        let frame = self
            .frame_for_phys(phys)
            .ok_or_else(|| CacheError::Source {
                source_name: "physical memory",
                reason: format!("frame {phys} is not in the memory map"),
            })?;
        if self.free_pages.remove(&frame) {
            return Ok(frame);
        }
        if self.headers[frame.index()].is_current() && !self.evict(frame)? {
            return Err(CacheError::FrameBusy {
                frame,
                reason: "occupant cannot be evicted",
            });
        }
        // Evicting a RAM frame put it back on the free list.
        self.free_pages.remove(&frame);
        Ok(frame)
    }

    /// Make `frame` the current copy of a page.
    pub fn install_page(
        &mut self,
        frame: FrameId,
        oid: Oid,
        alloc_count: ObCount,
        ob_type: ObType,
        page: PageBuf,
        flags: ObjectFlags,
    ) -> CacheResult<()> {
        self.check_frame(frame)?;
        let checksums = self.config.checksums;
        let hdr = &mut self.headers[frame.index()];
        hdr.oid = oid;
        hdr.alloc_count = alloc_count;
        hdr.call_count = 0;
        hdr.ob_type = ob_type;
        hdr.flags = flags | ObjectFlags::CURRENT;
        hdr.age = Age::NEW_BORN;
        hdr.checksum = (checksums && !hdr.is_dirty() && ob_type != ObType::PtDevicePage)
            .then(|| page_checksum(&page));
        hdr.body = ObjectBody::Page(page);
        self.hash.intern(&mut self.headers, frame);
        trace!(%oid, ?frame, "installed page");
        Ok(())
    }

    /// Make `frame` the current copy of a node.
    pub fn install_node(
        &mut self,
        frame: FrameId,
        oid: Oid,
        alloc_count: ObCount,
        call_count: ObCount,
        data: NodeData,
        flags: ObjectFlags,
    ) -> CacheResult<()> {
        self.check_frame(frame)?;
        let hdr = &mut self.headers[frame.index()];
        hdr.oid = oid;
        hdr.alloc_count = alloc_count;
        hdr.call_count = call_count;
        hdr.ob_type = ObType::NtUnprepared;
        hdr.flags = flags | ObjectFlags::CURRENT;
        hdr.age = Age::NEW_BORN;
        hdr.checksum = None;
        hdr.body = ObjectBody::Node(data);
        self.hash.intern(&mut self.headers, frame);
        trace!(%oid, ?frame, "installed node");
        Ok(())
    }

    /// Record that the object's current contents are safely stored.
    pub fn mark_clean(&mut self, frame: FrameId) {
        let checksums = self.config.checksums;
        let hdr = &mut self.headers[frame.index()];
        hdr.flags
            .remove(ObjectFlags::DIRTY | ObjectFlags::REDIRTY | ObjectFlags::CKPT);
        hdr.checksum = match hdr.page() {
            Some(page) if checksums && hdr.ob_type != ObType::PtDevicePage => {
                Some(page_checksum(page))
            }
            _ => None,
        };
    }

    /// Drop whatever the frame holds and return it to the free pool.
    pub fn release_frame(&mut self, frame: FrameId) {
        if self.headers[frame.index()].interned {
            self.hash.unintern(&mut self.headers, frame);
        }
        self.keyring.unprepare_all(frame);
        let hdr = &mut self.headers[frame.index()];
        hdr.reset();
        hdr.pin_count = 0;
        if hdr.is_node_frame() {
            self.free_nodes.insert(frame);
        } else if let Some(phys) = hdr.phys_frame {
            if self.pmem.region_for(phys).map(|r| r.kind) == Some(PmemKind::Ram) {
                self.free_pages.insert(frame);
            }
        }
    }

    fn can_clean(&self, frame: FrameId) -> bool {
        let hdr = &self.headers[frame.index()];
        hdr.flags.contains(ObjectFlags::CLEANABLE)
            && !hdr.flags.contains(ObjectFlags::IO)
            && (hdr.is_frozen() || !self.checkpoint_active)
    }

    fn write_back(&mut self, frame: FrameId) -> CacheResult<bool> {
        let oid = self.headers[frame.index()].oid;
        let Some(source) = self.source_for(oid) else {
            warn!(%oid, "dirty object has no source");
            return Ok(false);
        };
        let cleaned = source.write_back(self, frame)?;
        if cleaned {
            debug!(%oid, source = source.name(), "cleaned object");
        }
        Ok(cleaned)
    }

    /// Remove an object from memory, cleaning it first if dirty.
    ///
    /// Prepared capabilities are unprepared. Returns `Ok(false)` if the
    /// object is pinned or cannot be cleaned now.
    pub fn evict(&mut self, frame: FrameId) -> CacheResult<bool> {
        self.check_frame(frame)?;
        let hdr = &self.headers[frame.index()];
        if !hdr.is_current() {
            return Ok(self.is_free_listed(frame));
        }
        if hdr.pin_count > 0 {
            return Ok(false);
        }
        if hdr.is_dirty() {
            if !self.can_clean(frame) || !self.write_back(frame)? {
                return Ok(false);
            }
        }
        debug!(oid = %self.headers[frame.index()].oid, ?frame, "evicted");
        self.release_frame(frame);
        Ok(true)
    }

    /// Get `frame` ready to be modified and return the frame to modify.
    ///
    /// A frozen object is copied first: the old frame becomes the
    /// checkpoint's working copy and the new frame takes over the OID and
    /// the prepared capabilities.
    pub fn prepare_for_write(&mut self, frame: FrameId) -> CacheResult<FrameId> {
        self.check_frame(frame)?;
        if !self.headers[frame.index()].is_current() {
            return Err(CacheError::FrameBusy {
                frame,
                reason: "object is not current",
            });
        }
        if !self.headers[frame.index()].is_frozen() {
            self.mark_dirty(frame);
            return Ok(frame);
        }

        let is_node = self.headers[frame.index()].is_node_frame();
        self.headers[frame.index()].pin_count += 1;
        let grabbed = if is_node {
            self.grab_node_frame()
        } else {
            self.grab_page_frame()
        };
        self.headers[frame.index()].pin_count -= 1;
        let copy = grabbed?;

        // Aging may have cleaned the frozen frame while looking for a copy.
        if !self.headers[frame.index()].is_frozen() {
            self.release_frame(copy);
            self.mark_dirty(frame);
            return Ok(frame);
        }

        self.hash.unintern(&mut self.headers, frame);
        let old = &mut self.headers[frame.index()];
        let (oid, alloc_count, call_count, ob_type, body) =
            (old.oid, old.alloc_count, old.call_count, old.ob_type, old.body.clone());
        let cleanable = old.flags.contains(ObjectFlags::CLEANABLE);
        old.ob_type = if is_node {
            ObType::NtWorkingCopy
        } else {
            ObType::PtWorkingCopy
        };
        old.flags.remove(ObjectFlags::CURRENT);

        let new = &mut self.headers[copy.index()];
        new.oid = oid;
        new.alloc_count = alloc_count;
        new.call_count = call_count;
        new.ob_type = ob_type;
        new.flags = ObjectFlags::CURRENT | ObjectFlags::DIRTY;
        new.flags.set(ObjectFlags::CLEANABLE, cleanable);
        new.age = Age::NEW_BORN;
        new.checksum = None;
        new.body = body;
        self.hash.intern(&mut self.headers, copy);
        self.keyring.move_ring(frame, copy);
        debug!(%oid, from = ?frame, to = ?copy, "copied frozen object");
        Ok(copy)
    }

    fn mark_dirty(&mut self, frame: FrameId) {
        let hdr = &mut self.headers[frame.index()];
        if hdr.flags.contains(ObjectFlags::IO) {
            hdr.flags.insert(ObjectFlags::REDIRTY);
        }
        hdr.flags.insert(ObjectFlags::DIRTY);
        hdr.checksum = None;
        hdr.age = Age::NEW_BORN;
    }

    /// Free the object and reallocate its OID: contents are cleared, the
    /// allocation count goes up by one and every capability to the old
    /// incarnation goes stale.
    pub fn rescind(&mut self, frame: FrameId) -> CacheResult<FrameId> {
        let frame = self.prepare_for_write(frame)?;
        self.keyring.unprepare_all(frame);
        let hdr = &mut self.headers[frame.index()];
        hdr.alloc_count = hdr.alloc_count.wrapping_add(1);
        hdr.flags.insert(ObjectFlags::ALLOC_CNT_USED);
        match &mut hdr.body {
            ObjectBody::Page(page) => page.clear(),
            ObjectBody::Node(node) => *node = NodeData::empty(),
        }
        debug!(oid = %hdr.oid, alloc_count = hdr.alloc_count, "rescinded object");
        Ok(frame)
    }

    pub fn pin(&mut self, frame: FrameId) {
        self.headers[frame.index()].pin_count += 1;
    }

    pub fn unpin(&mut self, frame: FrameId) {
        let hdr = &mut self.headers[frame.index()];
        hdr.pin_count = hdr.pin_count.saturating_sub(1);
    }

    // Capabilities

    /// Record that `holder` is prepared against `frame`.
    pub fn prepare_key(&mut self, holder: HolderId, frame: FrameId) {
        self.keyring.prepare(holder, frame);
    }

    pub fn unprepare_key(&mut self, holder: HolderId) -> Option<FrameId> {
        self.keyring.unprepare(holder)
    }

    // Checkpoint interaction

    /// While set, only frozen objects are cleaned.
    pub fn set_checkpoint_active(&mut self, active: bool) {
        self.checkpoint_active = active;
    }

    pub fn checkpoint_active(&self) -> bool {
        self.checkpoint_active
    }

    // Aging

    /// Age page frames until at least `free_target` are free.
    pub fn age_page_frames(&mut self) -> CacheResult<()> {
        self.age_frames(false)
    }

    /// Age node frames until at least `free_target` are free.
    pub fn age_node_frames(&mut self) -> CacheResult<()> {
        self.age_frames(true)
    }

    fn age_frames(&mut self, nodes: bool) -> CacheResult<()> {
        let (base, count, kind) = if nodes {
            (self.n_page_frames, self.config.node_frames, "node")
        } else {
            (0, self.n_page_frames, "page")
        };
        let target = self.config.free_target.max(1);

        // Enough steps to carry every frame from new-born to stolen.
        let max_steps = count as usize * (Age::STEAL.value() as usize + 1);
        for _ in 0..max_steps {
            if self.free_count(nodes) >= target {
                return Ok(());
            }
            let cursor = if nodes {
                &mut self.node_cursor
            } else {
                &mut self.page_cursor
            };
            let frame = FrameId(base + *cursor);
            *cursor = (*cursor + 1) % count;
            self.age_one(frame)?;
        }
        if self.free_count(nodes) > 0 {
            return Ok(());
        }

        let frames = &self.headers[base as usize..(base + count) as usize];
        let pinned = frames.iter().filter(|h| h.pin_count > 0).count();
        warn!(kind, pinned, "aging found no reclaimable frame");
        Err(CacheError::AllFramesStuck {
            kind,
            stuck: count as usize - pinned,
            pinned,
        })
    }

    fn free_count(&self, nodes: bool) -> usize {
        if nodes {
            self.free_nodes.len()
        } else {
            self.free_pages.len()
        }
    }

    fn age_one(&mut self, frame: FrameId) -> CacheResult<()> {
        let hdr = &mut self.headers[frame.index()];
        if !hdr.is_current()
            || !hdr.ob_type.is_ageable()
            || hdr.pin_count > 0
            || hdr.flags.contains(ObjectFlags::IO)
            || hdr.oid.is_physical()
        {
            return Ok(());
        }
        hdr.age.bump();
        let age = hdr.age;

        if age == Age::INVALIDATE {
            let dropped = self.keyring.unprepare_all(frame);
            if dropped > 0 {
                trace!(?frame, dropped, "unprepared keys of aging object");
            }
        }
        if age >= Age::CLEAN && self.headers[frame.index()].is_dirty() {
            if !self.can_clean(frame) || !self.write_back(frame)? {
                return Ok(());
            }
        }
        if age == Age::STEAL
            && !self.headers[frame.index()].is_dirty()
            && self.keyring.is_empty(frame)
        {
            trace!(oid = %self.headers[frame.index()].oid, ?frame, "stole frame");
            self.release_frame(frame);
        }
        Ok(())
    }
}
