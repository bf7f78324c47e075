use std::collections::{BTreeSet, HashMap};

use crate::header::FrameId;

/// Identifies one prepared capability (one key slot somewhere).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HolderId(pub u64);

/// Registry of prepared capabilities, indexed both ways.
///
/// A frame whose ring is empty has no prepared capability pointing at it
/// and may be evicted.
#[derive(Debug, Default)]
pub struct KeyRing {
    by_frame: HashMap<FrameId, BTreeSet<HolderId>>,
    by_holder: HashMap<HolderId, FrameId>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `holder` at `frame`, dropping whatever it pointed at before.
    pub fn prepare(&mut self, holder: HolderId, frame: FrameId) {
        self.unprepare(holder);
        self.by_frame.entry(frame).or_default().insert(holder);
        self.by_holder.insert(holder, frame);
    }

    /// Returns the frame the holder pointed at.
    pub fn unprepare(&mut self, holder: HolderId) -> Option<FrameId> {
        let frame = self.by_holder.remove(&holder)?;
        if let Some(ring) = self.by_frame.get_mut(&frame) {
            ring.remove(&holder);
            if ring.is_empty() {
                self.by_frame.remove(&frame);
            }
        }
        Some(frame)
    }

    /// Unprepare every capability pointing at `frame`; returns how many.
    pub fn unprepare_all(&mut self, frame: FrameId) -> usize {
        let Some(ring) = self.by_frame.remove(&frame) else {
            return 0;
        };
        for holder in &ring {
            self.by_holder.remove(holder);
        }
        ring.len()
    }

    /// Repoint every capability at `from` to `to`.
    pub fn move_ring(&mut self, from: FrameId, to: FrameId) {
        let Some(ring) = self.by_frame.remove(&from) else {
            return;
        };
        for holder in &ring {
            self.by_holder.insert(*holder, to);
        }
        self.by_frame.entry(to).or_default().extend(ring);
    }

    pub fn key_is_prepared(&self, holder: HolderId) -> Option<FrameId> {
        self.by_holder.get(&holder).copied()
    }

    pub fn is_empty(&self, frame: FrameId) -> bool {
        !self.by_frame.contains_key(&frame)
    }

    pub fn holders(&self, frame: FrameId) -> Vec<HolderId> {
        self.by_frame
            .get(&frame)
            .map(|ring| ring.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every frame with at least one prepared capability.
    pub fn targets(&self) -> impl Iterator<Item = FrameId> + '_ {
        self.by_frame.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_moves_holder() {
        let mut ring = KeyRing::new();
        ring.prepare(HolderId(1), FrameId(3));
        ring.prepare(HolderId(1), FrameId(4));
        assert!(ring.is_empty(FrameId(3)));
        assert_eq!(ring.key_is_prepared(HolderId(1)), Some(FrameId(4)));
    }

    #[test]
    fn unprepare_all_clears_both_indexes() {
        let mut ring = KeyRing::new();
        ring.prepare(HolderId(1), FrameId(3));
        ring.prepare(HolderId(2), FrameId(3));
        ring.prepare(HolderId(3), FrameId(5));
        assert_eq!(ring.unprepare_all(FrameId(3)), 2);
        assert!(ring.is_empty(FrameId(3)));
        assert_eq!(ring.key_is_prepared(HolderId(1)), None);
        assert_eq!(ring.key_is_prepared(HolderId(3)), Some(FrameId(5)));
        assert_eq!(ring.unprepare_all(FrameId(3)), 0);
    }

    #[test]
    fn move_ring_repoints_holders() {
        let mut ring = KeyRing::new();
        ring.prepare(HolderId(1), FrameId(3));
        ring.prepare(HolderId(2), FrameId(3));
        ring.prepare(HolderId(9), FrameId(7));
        ring.move_ring(FrameId(3), FrameId(7));
        assert!(ring.is_empty(FrameId(3)));
        assert_eq!(ring.holders(FrameId(7)), vec![HolderId(1), HolderId(2), HolderId(9)]);
        assert_eq!(ring.key_is_prepared(HolderId(2)), Some(FrameId(7)));
    }
}
