use std::collections::BTreeMap;

use capros_store::{DiskCheckpointHdr, DISK_NODES_PER_PAGE};
use capros_types::{GenNum, Lid, ObCount, CKPT_ROOT_1, MAIN_LOG_START};
use tracing::trace;

use crate::error::{PersistError, PersistResult};

/// The circular main log: frames from `MAIN_LOG_START` up to the end of the
/// device.
///
/// `cursor` is the next frame to write and `tail` the oldest frame still
/// needed. One frame is always left unused so that `cursor == tail` means
/// empty.
#[derive(Clone, Debug)]
pub struct LogSpace {
    start: u32,
    end: u32,
    cursor: u32,
    tail: u32,
}

impl LogSpace {
    /// A log over frames `[MAIN_LOG_START, frame_count)`.
    pub fn new(frame_count: u32) -> PersistResult<Self> {
        let start = MAIN_LOG_START.frame();
        if frame_count < start + 2 {
            return Err(PersistError::Config(format!(
                "log device has {frame_count} frames, needs at least {}",
                start + 2
            )));
        }
        Ok(Self {
            start,
            end: frame_count,
            cursor: start,
            tail: start,
        })
    }

    pub fn size(&self) -> u32 {
        self.end - self.start
    }

    /// Frames between the tail and the cursor.
    pub fn used(&self) -> u32 {
        if self.cursor >= self.tail {
            self.cursor - self.tail
        } else {
            self.size() - (self.tail - self.cursor)
        }
    }

    pub fn available(&self) -> u32 {
        self.size() - self.used() - 1
    }

    pub fn percent_used(&self) -> u32 {
        self.used() * 100 / self.size()
    }

    pub fn cursor(&self) -> Lid {
        Lid::from_frame(self.cursor).unwrap_or(MAIN_LOG_START)
    }

    pub fn tail(&self) -> Lid {
        Lid::from_frame(self.tail).unwrap_or(MAIN_LOG_START)
    }

    /// The last LID the log may use, as recorded in anchors.
    pub fn max_lid(&self) -> Lid {
        Lid::from_frame(self.end - 1).unwrap_or(CKPT_ROOT_1)
    }

    pub fn contains(&self, lid: Lid) -> bool {
        (self.start..self.end).contains(&lid.frame())
    }

    /// Take the frame at the cursor.
    pub fn next_log_loc(&mut self) -> PersistResult<Lid> {
        if self.available() == 0 {
            return Err(PersistError::LogFull);
        }
        let lid = Lid::from_frame(self.cursor)?;
        self.cursor += 1;
        if self.cursor == self.end {
            self.cursor = self.start;
        }
        trace!(%lid, "allocated log frame");
        Ok(lid)
    }

    pub fn set_cursor(&mut self, lid: Lid) -> PersistResult<()> {
        self.cursor = self.checked(lid)?;
        Ok(())
    }

    pub fn set_tail(&mut self, lid: Lid) -> PersistResult<()> {
        self.tail = self.checked(lid)?;
        Ok(())
    }

    fn checked(&self, lid: Lid) -> PersistResult<u32> {
        if !self.contains(lid) {
            return Err(PersistError::Config(format!(
                "{lid} is outside the main log {}..{}",
                self.start, self.end
            )));
        }
        Ok(lid.frame())
    }
}

/// Frames a checkpoint of the given size needs, assuming nothing is written
/// in between.
pub fn calc_log_reservation(
    dirty_pages: usize,
    dirty_nodes: usize,
    existing_entries: usize,
    thread_entries: usize,
    reserve_entries: usize,
) -> u32 {
    use capros_store::{CkptDirent, DirEntryCodec, ReserveDirent, ThreadDirent};

    let pots = dirty_nodes.div_ceil(DISK_NODES_PER_PAGE) + 1;
    let dir_pages = (existing_entries + dirty_pages + dirty_nodes).div_ceil(CkptDirent::PER_PAGE);
    let thread_pages = thread_entries.div_ceil(ThreadDirent::PER_PAGE);
    let reserve_pages = reserve_entries.div_ceil(ReserveDirent::PER_PAGE);
    (dirty_pages + pots + dir_pages + thread_pages + reserve_pages + 1) as u32
}

/// Where a stabilized generation sits in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationRecord {
    pub first_lid: Lid,
    pub header_lid: Lid,
    pub n_dir_pages: u32,
}

/// Generation bookkeeping.
///
/// Every object version is written into `working`. A checkpoint closes the
/// working generation and makes it `stabilized`; migration then copies it
/// home and advances `migrated`. `durable_migrated` trails `migrated` until
/// an anchor records it, and only then may the generation's log space be
/// reused.
#[derive(Clone, Debug)]
pub struct Generations {
    pub working: GenNum,
    pub working_first_lid: Lid,
    pub stabilized: GenNum,
    pub migrated: GenNum,
    pub durable_migrated: GenNum,
    /// Generations written to the log whose frames are still needed.
    pub records: BTreeMap<GenNum, GenerationRecord>,
    /// Anchor slot written last.
    pub root: Lid,
    pub thread_dir_pages: Vec<Lid>,
    pub reserve_dir_pages: Vec<Lid>,
    pub time_of_demarc: u64,
    /// Highest allocation count handed to a non-persistent object.
    pub max_np_count: ObCount,
}

impl Generations {
    /// State of a freshly formatted log: nothing stabilized, generation 1
    /// accumulating.
    pub fn big_bang() -> Self {
        Self {
            working: 1,
            working_first_lid: MAIN_LOG_START,
            stabilized: 0,
            migrated: 0,
            durable_migrated: 0,
            records: BTreeMap::new(),
            root: CKPT_ROOT_1,
            thread_dir_pages: Vec::new(),
            reserve_dir_pages: Vec::new(),
            time_of_demarc: 0,
            max_np_count: 0,
        }
    }

    /// Forget records whose frames are no longer needed.
    pub fn prune(&mut self) {
        let (durable, stabilized) = (self.durable_migrated, self.stabilized);
        self.records.retain(|&g, _| g > durable || g == stabilized);
    }

    /// Oldest frame still needed.
    pub fn log_tail(&self) -> Lid {
        self.tail_for(self.stabilized, self.durable_migrated)
    }

    /// Oldest frame still needed once an anchor commits `stabilized` and
    /// `migrated`. The latest stabilized generation always stays: its
    /// thread and reserve directories are only in the log.
    pub fn tail_for(&self, stabilized: GenNum, migrated: GenNum) -> Lid {
        self.records
            .iter()
            .find(|(&g, _)| g > migrated || g == stabilized)
            .map_or(self.working_first_lid, |(_, r)| r.first_lid)
    }

    /// Build an anchor committing generation `sequence`.
    ///
    /// Lists the header of every logged generation up to `sequence` that is
    /// not yet migrated, plus the latest one if it is.
    #[allow(clippy::too_many_arguments)]
    pub fn anchor(
        &self,
        sequence: GenNum,
        migrated: GenNum,
        log_head: Lid,
        log_tail: Lid,
        max_log_lid: Lid,
        thread_dir_pages: &[Lid],
        reserve_dir_pages: &[Lid],
        time_of_demarc: u64,
    ) -> DiskCheckpointHdr {
        let listed: Vec<(&GenNum, &GenerationRecord)> = self
            .records
            .range(..=sequence)
            .filter(|(&g, _)| g > migrated || g == sequence)
            .collect();
        DiskCheckpointHdr {
            sequence_number: sequence,
            has_migrated: migrated >= sequence,
            max_log_lid,
            migrated_generation: migrated,
            n_dir_page: listed.iter().map(|(_, r)| r.n_dir_pages).sum(),
            max_np_count: self.max_np_count,
            log_tail,
            log_head,
            time_of_demarc,
            generation_hdrs: listed.iter().map(|(_, r)| r.header_lid).collect(),
            thread_dir_pages: thread_dir_pages.to_vec(),
            reserve_dir_pages: reserve_dir_pages.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lid(frame: u32) -> Lid {
        Lid::from_frame(frame).unwrap()
    }

    #[test]
    fn log_space_wraps_and_keeps_one_frame_free() {
        let start = MAIN_LOG_START.frame();
        let mut space = LogSpace::new(start + 4).unwrap();
        assert_eq!(space.size(), 4);
        assert_eq!(space.available(), 3);

        for i in 0..3 {
            assert_eq!(space.next_log_loc().unwrap(), lid(start + i));
        }
        assert!(matches!(space.next_log_loc(), Err(PersistError::LogFull)));
        assert_eq!(space.percent_used(), 75);

        space.set_tail(lid(start + 2)).unwrap();
        assert_eq!(space.available(), 2);
        assert_eq!(space.next_log_loc().unwrap(), lid(start + 3));
        assert_eq!(space.next_log_loc().unwrap(), lid(start));
        assert_eq!(space.cursor(), lid(start + 1));
        assert_eq!(space.used(), 3);
        assert!(space.set_tail(CKPT_ROOT_1).is_err());
    }

    #[test]
    fn device_must_have_main_log_room() {
        assert!(LogSpace::new(MAIN_LOG_START.frame() + 1).is_err());
    }

    #[test]
    fn reservation_counts_every_frame_kind() {
        // 3 pages, 8 nodes (two pots plus one open), 11 dirents (one page),
        // one thread page, no reserves, one generation header.
        assert_eq!(calc_log_reservation(3, 8, 0, 1, 0), 3 + 3 + 1 + 1 + 1);
        assert_eq!(calc_log_reservation(0, 0, 0, 0, 0), 2);
    }

    #[test]
    fn tail_follows_oldest_retained_generation() {
        let mut gens = Generations::big_bang();
        assert_eq!(gens.log_tail(), MAIN_LOG_START);

        for (g, frame) in [(1, 0x3), (2, 0x10), (3, 0x20)] {
            gens.records.insert(
                g,
                GenerationRecord {
                    first_lid: lid(frame),
                    header_lid: lid(frame + 5),
                    n_dir_pages: 1,
                },
            );
        }
        gens.stabilized = 3;
        gens.working = 4;
        gens.working_first_lid = lid(0x30);
        assert_eq!(gens.log_tail(), lid(0x3));

        gens.migrated = 2;
        assert_eq!(gens.log_tail(), lid(0x3));
        gens.durable_migrated = 2;
        assert_eq!(gens.log_tail(), lid(0x20));

        // The latest stabilized generation is kept even once migrated.
        gens.durable_migrated = 3;
        gens.prune();
        assert_eq!(gens.records.keys().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(gens.log_tail(), lid(0x20));
    }

    #[test]
    fn anchor_lists_unmigrated_generations() {
        let mut gens = Generations::big_bang();
        for g in 1..=3 {
            gens.records.insert(
                g,
                GenerationRecord {
                    first_lid: lid(0x10 * g as u32),
                    header_lid: lid(0x10 * g as u32 + 1),
                    n_dir_pages: 2,
                },
            );
        }
        let hdr = gens.anchor(3, 1, lid(0x40), lid(0x20), lid(0x80), &[lid(0x35)], &[], 9);
        assert_eq!(hdr.generation_hdrs, vec![lid(0x21), lid(0x31)]);
        assert_eq!(hdr.n_dir_page, 4);
        assert!(!hdr.has_migrated);

        let hdr = gens.anchor(2, 2, lid(0x40), lid(0x20), lid(0x80), &[], &[], 9);
        assert_eq!(hdr.generation_hdrs, vec![lid(0x21)]);
        assert!(hdr.has_migrated);
    }
}
