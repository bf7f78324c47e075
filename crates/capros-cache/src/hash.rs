use capros_types::{Age, ObType, Oid};
use tracing::warn;

use crate::header::{FrameId, ObjectHeader};

/// Bucket index for `oid` in a table of `n` buckets.
///
/// Mixes the low OID bits so that consecutive frames and consecutive
/// objects within a frame land in different buckets.
pub fn bucket(oid: Oid, n: usize) -> usize {
    let oid32 = oid.0 as u32;
    (((oid32 >> 8) ^ ((oid32 & 0xff) << 9)) as usize) % n
}

/// OID to frame index, chained through the headers themselves.
///
/// The chain links live in [`ObjectHeader`], so every operation takes the
/// header arena alongside the table.
#[derive(Debug)]
pub struct ObjectHash {
    heads: Vec<Option<FrameId>>,
    use_counts: Vec<u32>,
}

impl ObjectHash {
    pub fn new(buckets: usize) -> Self {
        let buckets = buckets.max(1);
        Self {
            heads: vec![None; buckets],
            use_counts: vec![0; buckets],
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.heads.len()
    }

    /// Lookups that landed on each bucket.
    pub fn use_count(&self, bucket: usize) -> u32 {
        self.use_counts[bucket]
    }

    /// Insert at the head of the OID's bucket.
    ///
    /// The header must be current and not already interned.
    pub fn intern(&mut self, arena: &mut [ObjectHeader], frame: FrameId) {
        let hdr = &mut arena[frame.index()];
        debug_assert!(hdr.is_current(), "interning non-current object {}", hdr.oid);
        debug_assert!(!hdr.interned, "object {} interned twice", hdr.oid);
        if hdr.interned {
            warn!(oid = %hdr.oid, "ignoring double intern");
            return;
        }
        let b = bucket(hdr.oid, self.heads.len());
        hdr.hash_next = self.heads[b];
        hdr.interned = true;
        self.heads[b] = Some(frame);
    }

    /// Remove from the OID's bucket; a no-op if it is not there.
    pub fn unintern(&mut self, arena: &mut [ObjectHeader], frame: FrameId) {
        let b = bucket(arena[frame.index()].oid, self.heads.len());
        let next = arena[frame.index()].hash_next;

        if self.heads[b] == Some(frame) {
            self.heads[b] = next;
        } else {
            let mut cursor = self.heads[b];
            while let Some(at) = cursor {
                let link = arena[at.index()].hash_next;
                if link == Some(frame) {
                    arena[at.index()].hash_next = next;
                    break;
                }
                cursor = link;
            }
        }
        let hdr = &mut arena[frame.index()];
        hdr.hash_next = None;
        hdr.interned = false;
    }

    /// Find the object for `oid` whose canonical type equals `ty`; a hit
    /// resets its age.
    pub fn lookup(&mut self, arena: &mut [ObjectHeader], ty: ObType, oid: Oid) -> Option<FrameId> {
        let b = bucket(oid, self.heads.len());
        self.use_counts[b] = self.use_counts[b].saturating_add(1);
        let found = self.find(arena, ty, oid)?;
        arena[found.index()].age = Age::NEW_BORN;
        Some(found)
    }

    /// Like [`ObjectHash::lookup`] but leaves ages alone.
    pub fn find(&self, arena: &[ObjectHeader], ty: ObType, oid: Oid) -> Option<FrameId> {
        let mut cursor = self.heads[bucket(oid, self.heads.len())];
        while let Some(at) = cursor {
            let hdr = &arena[at.index()];
            if hdr.oid == oid && hdr.ob_type.canonical() == ty {
                return Some(at);
            }
            cursor = hdr.hash_next;
        }
        None
    }

    /// Frames chained in one bucket, head first.
    pub fn chain(&self, arena: &[ObjectHeader], bucket: usize) -> Vec<FrameId> {
        let mut out = Vec::new();
        let mut cursor = self.heads[bucket];
        while let Some(at) = cursor {
            out.push(at);
            cursor = arena[at.index()].hash_next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capros_types::{ObjectFlags, OBJECTS_PER_FRAME};
    use proptest::prelude::*;

    fn arena(n: usize) -> Vec<ObjectHeader> {
        (0..n).map(|i| ObjectHeader::free_page(i as u64)).collect()
    }

    fn make_current(arena: &mut [ObjectHeader], i: usize, oid: Oid, ty: ObType) {
        let hdr = &mut arena[i];
        hdr.oid = oid;
        hdr.ob_type = ty;
        hdr.flags = ObjectFlags::CURRENT;
    }

    #[test]
    fn page_aligned_oids_spread_out() {
        let used: std::collections::HashSet<usize> = (0..64u64)
            .map(|f| bucket(Oid(f * OBJECTS_PER_FRAME), 64))
            .collect();
        assert_eq!(used.len(), 64);
        assert_ne!(bucket(Oid(0x1000), 1024), bucket(Oid(0x1001), 1024));
    }

    #[test]
    fn lookup_canonicalizes_types() {
        let mut arena = arena(2);
        let mut hash = ObjectHash::new(16);
        make_current(&mut arena, 0, Oid(0x1000), ObType::PtDevicePage);
        make_current(&mut arena, 1, Oid(0x2003), ObType::NtProcessRoot);
        hash.intern(&mut arena, FrameId(0));
        hash.intern(&mut arena, FrameId(1));

        assert_eq!(hash.lookup(&mut arena, ObType::PtDataPage, Oid(0x1000)), Some(FrameId(0)));
        assert_eq!(hash.lookup(&mut arena, ObType::NtUnprepared, Oid(0x2003)), Some(FrameId(1)));
        assert_eq!(hash.lookup(&mut arena, ObType::NtUnprepared, Oid(0x1000)), None);
    }

    #[test]
    fn lookup_resets_age() {
        let mut arena = arena(1);
        let mut hash = ObjectHash::new(4);
        make_current(&mut arena, 0, Oid(0x1000), ObType::PtDataPage);
        arena[0].age = Age::CLEAN;
        hash.intern(&mut arena, FrameId(0));
        hash.lookup(&mut arena, ObType::PtDataPage, Oid(0x1000));
        assert_eq!(arena[0].age, Age::NEW_BORN);
    }

    #[test]
    fn unintern_from_middle_of_chain() {
        let mut arena = arena(3);
        // One bucket forces every object onto the same chain.
        let mut hash = ObjectHash::new(1);
        for i in 0..3 {
            make_current(&mut arena, i, Oid(0x1000 + i as u64 * 256), ObType::PtDataPage);
            hash.intern(&mut arena, FrameId(i as u32));
        }
        assert_eq!(hash.chain(&arena, 0), vec![FrameId(2), FrameId(1), FrameId(0)]);
        hash.unintern(&mut arena, FrameId(1));
        assert_eq!(hash.chain(&arena, 0), vec![FrameId(2), FrameId(0)]);
        assert!(!arena[1].is_interned());

        // Absent objects are ignored.
        hash.unintern(&mut arena, FrameId(1));
        assert_eq!(hash.chain(&arena, 0).len(), 2);
    }

    proptest! {
        #[test]
        fn interned_objects_are_found(
            frames in proptest::collection::btree_set(0u64..1_000_000, 1..40),
            buckets in 1usize..64,
        ) {
            let frames: Vec<u64> = frames.into_iter().collect();
            let mut arena = arena(frames.len());
            let mut hash = ObjectHash::new(buckets);
            for (i, f) in frames.iter().enumerate() {
                make_current(&mut arena, i, Oid(0x1000 + f * 256), ObType::PtDataPage);
                hash.intern(&mut arena, FrameId(i as u32));
            }
            for (i, f) in frames.iter().enumerate() {
                let oid = Oid(0x1000 + f * 256);
                prop_assert_eq!(hash.find(&arena, ObType::PtDataPage, oid), Some(FrameId(i as u32)));
            }
            for i in (0..frames.len()).step_by(2) {
                hash.unintern(&mut arena, FrameId(i as u32));
            }
            for (i, f) in frames.iter().enumerate() {
                let oid = Oid(0x1000 + f * 256);
                let expected = (i % 2 == 1).then_some(FrameId(i as u32));
                prop_assert_eq!(hash.find(&arena, ObType::PtDataPage, oid), expected);
            }
        }
    }
}
