use capros_store::{NodeData, PageBuf};
use capros_types::{Age, BaseType, ObCount, ObType, ObjectFlags, Oid};

/// Stable index of an object header in the cache's frame arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl FrameId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Contents of a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectBody {
    Page(PageBuf),
    Node(NodeData),
}

/// In-core state of one object (or one free frame).
///
/// Headers live in a fixed arena owned by the cache. Capabilities never hold
/// a header; they are registered in the cache's key ring instead.
#[derive(Clone, Debug)]
pub struct ObjectHeader {
    pub oid: Oid,
    pub alloc_count: ObCount,
    /// Nodes only.
    pub call_count: ObCount,
    pub ob_type: ObType,
    pub flags: ObjectFlags,
    pub age: Age,
    /// Taken when a non-device page becomes clean.
    pub checksum: Option<u64>,
    /// Pinned frames are never aged or stolen.
    pub pin_count: u32,
    /// Physical frame number, for page frames.
    pub phys_frame: Option<u64>,
    pub body: ObjectBody,
    pub(crate) hash_next: Option<FrameId>,
    pub(crate) interned: bool,
}

impl ObjectHeader {
    pub(crate) fn free_page(phys_frame: u64) -> Self {
        Self::free(ObType::PtFreeFrame, Some(phys_frame), ObjectBody::Page(PageBuf::zeroed()))
    }

    pub(crate) fn free_node() -> Self {
        Self::free(ObType::NtFreeFrame, None, ObjectBody::Node(NodeData::empty()))
    }

    fn free(ob_type: ObType, phys_frame: Option<u64>, body: ObjectBody) -> Self {
        Self {
            oid: Oid(0),
            alloc_count: 0,
            call_count: 0,
            ob_type,
            flags: ObjectFlags::empty(),
            age: Age::NEW_BORN,
            checksum: None,
            pin_count: 0,
            phys_frame,
            body,
            hash_next: None,
            interned: false,
        }
    }

    /// Return the header to the free state, keeping its body storage.
    pub(crate) fn reset(&mut self) {
        self.ob_type = if self.ob_type.is_node() {
            ObType::NtFreeFrame
        } else {
            ObType::PtFreeFrame
        };
        self.oid = Oid(0);
        self.alloc_count = 0;
        self.call_count = 0;
        self.flags = ObjectFlags::empty();
        self.age = Age::NEW_BORN;
        self.checksum = None;
        self.hash_next = None;
        self.interned = false;
        match &mut self.body {
            ObjectBody::Page(page) => page.clear(),
            ObjectBody::Node(node) => *node = NodeData::empty(),
        }
    }

    pub fn is_current(&self) -> bool {
        self.flags.contains(ObjectFlags::CURRENT)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(ObjectFlags::DIRTY)
    }

    /// Frozen for the checkpoint in flight.
    pub fn is_frozen(&self) -> bool {
        self.flags.contains(ObjectFlags::CKPT)
    }

    pub fn is_interned(&self) -> bool {
        self.interned
    }

    pub fn is_node_frame(&self) -> bool {
        matches!(self.body, ObjectBody::Node(_))
    }

    pub fn base_type(&self) -> Option<BaseType> {
        self.ob_type.base_type()
    }

    /// The count a capability must carry: allocation count for pages,
    /// the larger of allocation and call counts for nodes.
    pub fn key_count(&self) -> ObCount {
        if self.is_node_frame() {
            self.alloc_count.max(self.call_count)
        } else {
            self.alloc_count
        }
    }

    pub fn page(&self) -> Option<&PageBuf> {
        match &self.body {
            ObjectBody::Page(page) => Some(page),
            ObjectBody::Node(_) => None,
        }
    }

    pub fn page_mut(&mut self) -> Option<&mut PageBuf> {
        match &mut self.body {
            ObjectBody::Page(page) => Some(page),
            ObjectBody::Node(_) => None,
        }
    }

    pub fn node(&self) -> Option<&NodeData> {
        match &self.body {
            ObjectBody::Node(node) => Some(node),
            ObjectBody::Page(_) => None,
        }
    }

    pub fn node_mut(&mut self) -> Option<&mut NodeData> {
        match &mut self.body {
            ObjectBody::Node(node) => Some(node),
            ObjectBody::Page(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_returns_to_free_type() {
        let mut hdr = ObjectHeader::free_node();
        hdr.ob_type = ObType::NtSegment;
        hdr.oid = Oid(0x1001);
        hdr.flags = ObjectFlags::CURRENT | ObjectFlags::DIRTY;
        hdr.node_mut().unwrap().slots[0].count = 9;
        hdr.reset();
        assert_eq!(hdr.ob_type, ObType::NtFreeFrame);
        assert!(hdr.flags.is_empty());
        assert!(hdr.node().unwrap().is_empty());
    }

    #[test]
    fn node_key_count_uses_larger_count() {
        let mut hdr = ObjectHeader::free_node();
        hdr.alloc_count = 3;
        hdr.call_count = 8;
        assert_eq!(hdr.key_count(), 8);

        let mut page = ObjectHeader::free_page(5);
        page.alloc_count = 3;
        assert_eq!(page.key_count(), 3);
        assert_eq!(page.phys_frame, Some(5));
    }
}
