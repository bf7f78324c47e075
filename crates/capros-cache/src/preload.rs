use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use capros_store::{NodeData, PageBuf};
use capros_types::{BaseType, ObCount, ObType, ObjectFlags, Oid, OidRange};
use tracing::{debug, warn};

use crate::cache::ObjectCache;
use crate::error::CacheResult;
use crate::header::FrameId;
use crate::traits::ObjectSource;

/// Objects baked into the boot image.
#[derive(Clone, Debug, Default)]
pub struct PreloadImage {
    pub base: Oid,
    /// Number of OID frames the image spans.
    pub frames: u64,
    pub pages: BTreeMap<Oid, PageBuf>,
    pub nodes: BTreeMap<Oid, NodeData>,
}

impl PreloadImage {
    pub fn new(base: Oid, frames: u64) -> Self {
        Self {
            base,
            frames,
            ..Self::default()
        }
    }

    pub fn with_page(mut self, oid: Oid, page: PageBuf) -> Self {
        self.pages.insert(oid, page);
        self
    }

    pub fn with_node(mut self, oid: Oid, data: NodeData) -> Self {
        self.nodes.insert(oid, data);
        self
    }

    pub fn range(&self) -> CacheResult<OidRange> {
        Ok(OidRange::frames(self.base, self.frames)?)
    }
}

/// Serves the objects of a [`PreloadImage`].
///
/// Every object comes up dirty with the current non-persistent allocation
/// count. OIDs in range that the image does not define come up as a zero
/// page or an empty node. Write-back is a no-op.
pub struct PreloadObjectSource {
    image: PreloadImage,
    range: OidRange,
    alloc_count: AtomicU32,
}

impl PreloadObjectSource {
    pub fn new(image: PreloadImage) -> CacheResult<Self> {
        let range = image.range()?;
        Ok(Self {
            image,
            range,
            alloc_count: AtomicU32::new(0),
        })
    }

    pub fn range(&self) -> OidRange {
        self.range
    }

    /// An image in the persistent range is the big bang image.
    pub fn is_persistent(&self) -> bool {
        self.image.base.is_persistent()
    }

    /// Allocation count given to every object materialized from now on.
    pub fn set_alloc_count(&self, count: ObCount) {
        self.alloc_count.store(count, Ordering::Relaxed);
    }

    pub fn alloc_count(&self) -> ObCount {
        self.alloc_count.load(Ordering::Relaxed)
    }

    fn flags(&self, oid: Oid) -> ObjectFlags {
        if oid.is_persistent() {
            ObjectFlags::DIRTY | ObjectFlags::CLEANABLE
        } else {
            ObjectFlags::DIRTY
        }
    }

    fn materialize(
        &self,
        cache: &mut ObjectCache,
        oid: Oid,
        base: BaseType,
    ) -> CacheResult<Option<FrameId>> {
        let count = self.alloc_count();
        match base {
            BaseType::Page => {
                if oid.index() != 0 || self.image.nodes.contains_key(&oid) {
                    warn!(%oid, "preloaded OID is not a page");
                    return Ok(None);
                }
                let page = self.image.pages.get(&oid).cloned().unwrap_or_default();
                let frame = cache.grab_page_frame()?;
                cache.install_page(frame, oid, count, ObType::PtDataPage, page, self.flags(oid))?;
                Ok(Some(frame))
            }
            BaseType::Node => {
                if self.image.pages.contains_key(&oid) {
                    warn!(%oid, "preloaded OID is not a node");
                    return Ok(None);
                }
                let data = self.image.nodes.get(&oid).cloned().unwrap_or_default();
                let frame = cache.grab_node_frame()?;
                cache.install_node(frame, oid, count, count, data, self.flags(oid))?;
                Ok(Some(frame))
            }
        }
    }

    /// Bring every object the image defines into the cache.
    ///
    /// Used for the big bang, where the image sits in the persistent range
    /// and its objects must all reach the first checkpoint.
    pub fn preload_all(&self, cache: &mut ObjectCache) -> CacheResult<usize> {
        let mut loaded = 0;
        let objects = self
            .image
            .pages
            .keys()
            .map(|&oid| (oid, BaseType::Page))
            .chain(self.image.nodes.keys().map(|&oid| (oid, BaseType::Node)));
        for (oid, base) in objects {
            if cache.lookup(base.fetched_type(), oid).is_some() {
                continue;
            }
            if self.materialize(cache, oid, base)?.is_some() {
                loaded += 1;
            }
        }
        debug!(loaded, base = %self.image.base, "preloaded image");
        Ok(loaded)
    }
}

impl ObjectSource for PreloadObjectSource {
    fn name(&self) -> &'static str {
        "preload"
    }

    fn get_object(
        &self,
        cache: &mut ObjectCache,
        oid: Oid,
        base: BaseType,
        count: ObCount,
        use_count: bool,
    ) -> CacheResult<Option<FrameId>> {
        if !self.range.contains(oid) {
            return Ok(None);
        }
        if use_count && count != self.alloc_count() {
            return Ok(None);
        }
        self.materialize(cache, oid, base)
    }

    fn write_back(&self, _cache: &mut ObjectCache, frame: FrameId) -> CacheResult<bool> {
        debug!(?frame, "preloaded objects are not written back");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::CacheConfig;
    use crate::physmem::PhysMem;
    use capros_store::{KeySlot, KeyType};

    fn image() -> PreloadImage {
        let mut node = NodeData::empty();
        node.slots[0] = KeySlot::new(KeyType::Page, Oid(0x100), 0);
        PreloadImage::new(Oid(0x100), 4)
            .with_page(Oid(0x100), PageBuf::filled(7))
            .with_node(Oid(0x201), node)
    }

    fn setup() -> (ObjectCache, Arc<PreloadObjectSource>) {
        let mut cache = ObjectCache::new(CacheConfig::small(4), PhysMem::ram_only(4));
        let source = Arc::new(PreloadObjectSource::new(image()).unwrap());
        source.set_alloc_count(3);
        cache.add_range(source.range(), source.clone()).unwrap();
        (cache, source)
    }

    #[test]
    fn image_objects_come_up_dirty_with_np_count() {
        let (mut cache, _) = setup();
        let frame = cache
            .get_object(Oid(0x100), BaseType::Page, 3, true)
            .unwrap()
            .unwrap();
        let hdr = cache.header(frame);
        assert_eq!(hdr.page(), Some(&PageBuf::filled(7)));
        assert_eq!(hdr.alloc_count, 3);
        assert!(hdr.is_dirty());
        assert!(!hdr.flags.contains(ObjectFlags::CLEANABLE));

        let node = cache
            .get_object(Oid(0x201), BaseType::Node, 3, true)
            .unwrap()
            .unwrap();
        assert_eq!(cache.header(node).node().unwrap().slots[0].oid, Oid(0x100));
    }

    #[test]
    fn undefined_oids_are_null_objects() {
        let (mut cache, _) = setup();
        let page = cache
            .get_object(Oid(0x300), BaseType::Page, 0, false)
            .unwrap()
            .unwrap();
        assert!(cache.header(page).page().unwrap().is_zero());
        let node = cache
            .get_object(Oid(0x305), BaseType::Node, 0, false)
            .unwrap()
            .unwrap();
        assert!(cache.header(node).node().unwrap().is_empty());
    }

    #[test]
    fn wrong_type_or_count_is_refused() {
        let (mut cache, _) = setup();
        assert_eq!(cache.get_object(Oid(0x201), BaseType::Page, 3, true).unwrap(), None);
        assert_eq!(cache.get_object(Oid(0x100), BaseType::Node, 3, true).unwrap(), None);
        assert_eq!(cache.get_object(Oid(0x100), BaseType::Page, 2, true).unwrap(), None);
    }

    #[test]
    fn preloaded_objects_are_never_evicted() {
        let (mut cache, _) = setup();
        let frame = cache
            .get_object(Oid(0x100), BaseType::Page, 3, true)
            .unwrap()
            .unwrap();
        assert!(!cache.evict(frame).unwrap());
        assert!(cache.header(frame).is_current());
    }

    #[test]
    fn persistent_image_is_cleanable() {
        let mut cache = ObjectCache::new(CacheConfig::small(4), PhysMem::ram_only(4));
        let source = PreloadObjectSource::new(
            PreloadImage::new(Oid(0x1000), 2).with_page(Oid(0x1000), PageBuf::filled(1)),
        )
        .unwrap();
        assert!(source.is_persistent());
        assert_eq!(source.preload_all(&mut cache).unwrap(), 1);
        let frame = cache.lookup(ObType::PtDataPage, Oid(0x1000)).unwrap();
        assert!(cache.header(frame).flags.contains(ObjectFlags::CLEANABLE));
        // A second pass finds everything resident.
        assert_eq!(source.preload_all(&mut cache).unwrap(), 0);
    }
}
