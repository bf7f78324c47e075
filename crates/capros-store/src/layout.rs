//! Bit-exact encodings of the log's header and directory frames.
//!
//! Every frame written here ends with a CRC32 of its first
//! [`SEAL_OFFSET`] bytes, so a torn or never-written frame fails to decode.

use capros_types::{BaseType, GenNum, Lid, LidTag, ObCount, Oid, PackedLid, TypeError, MAX_LID_VALUE};

use crate::error::{StoreError, StoreResult};
use crate::page::PageBuf;

/// Offset of the CRC32 trailer in every sealed frame.
pub const SEAL_OFFSET: usize = 4092;

pub const CKPT_HDR_VERSION: u32 = 1;
pub const GENERATION_HDR_VERSION: u32 = 1;

const ANCHOR_LIDS_AT: usize = 72;
const GENERATION_LIDS_AT: usize = 40;
const DIR_ENTRIES_AT: usize = 4;

/// Maximum number of `lid_t` words an anchor can carry.
pub const MAX_ANCHOR_LIDS: usize = (SEAL_OFFSET - ANCHOR_LIDS_AT) / 4;

/// Maximum number of object directory pages one generation header can list.
pub const MAX_GENERATION_DIR_PAGES: usize = (SEAL_OFFSET - GENERATION_LIDS_AT) / 4;

fn frame_crc(page: &PageBuf) -> u32 {
    crc32fast::hash(&page.as_bytes()[..SEAL_OFFSET])
}

/// Write the CRC32 trailer.
pub fn seal(page: &mut PageBuf) {
    let crc = frame_crc(page);
    page.put_u32(SEAL_OFFSET, crc);
}

/// Check the CRC32 trailer of a frame read from `lid`.
pub fn verify_seal(page: &PageBuf, what: &'static str, lid: Lid) -> StoreResult<()> {
    let expected = page.get_u32(SEAL_OFFSET);
    let actual = frame_crc(page);
    if expected != actual {
        return Err(StoreError::CrcMismatch {
            what,
            lid,
            expected,
            actual,
        });
    }
    Ok(())
}

fn put_lids(page: &mut PageBuf, at: usize, lids: impl Iterator<Item = PackedLid>) {
    for (i, packed) in lids.enumerate() {
        page.put_u32(at + i * 4, packed.to_u32());
    }
}

fn get_lids(
    page: &PageBuf,
    at: usize,
    count: usize,
    expected: LidTag,
    what: &'static str,
) -> StoreResult<Vec<Lid>> {
    (0..count)
        .map(|i| {
            let packed = PackedLid::from_u32(page.get_u32(at + i * 4))?;
            if packed.tag != expected {
                return Err(StoreError::Malformed {
                    what,
                    reason: format!("entry {i} tagged {:?}, expected {expected:?}", packed.tag),
                });
            }
            Ok(packed.lid)
        })
        .collect()
}

fn lid_at(page: &PageBuf, at: usize) -> StoreResult<Lid> {
    Ok(Lid::new(page.get_u32(at))?)
}

/// The checkpoint anchor, written alternately to the two root slots.
///
/// Restart trusts the valid anchor with the highest
/// `(sequence_number, migrated_generation)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskCheckpointHdr {
    pub sequence_number: u64,
    /// Every generation up to `sequence_number` has been migrated.
    pub has_migrated: bool,
    /// Log wrap point the anchor was written against.
    pub max_log_lid: Lid,
    pub migrated_generation: GenNum,
    /// Total object directory pages across the listed generations.
    pub n_dir_page: u32,
    pub max_np_count: ObCount,
    /// Oldest log frame still holding live data.
    pub log_tail: Lid,
    /// Next frame the log cursor writes after this checkpoint.
    pub log_head: Lid,
    pub time_of_demarc: u64,
    /// Unmigrated generation headers, oldest first.
    pub generation_hdrs: Vec<Lid>,
    pub thread_dir_pages: Vec<Lid>,
    pub reserve_dir_pages: Vec<Lid>,
}

impl DiskCheckpointHdr {
    fn lid_count(&self) -> usize {
        self.generation_hdrs.len() + self.thread_dir_pages.len() + self.reserve_dir_pages.len()
    }

    pub fn encode(&self) -> StoreResult<PageBuf> {
        let count = self.lid_count();
        if count > MAX_ANCHOR_LIDS {
            return Err(StoreError::TooManyEntries {
                what: "checkpoint anchor",
                count,
                max: MAX_ANCHOR_LIDS,
            });
        }

        let mut page = PageBuf::zeroed();
        page.put_u64(0, self.sequence_number);
        page.as_bytes_mut()[8] = self.has_migrated as u8;
        page.put_u32(12, self.max_log_lid.raw());
        page.put_u32(16, self.n_dir_page);
        page.put_u32(20, self.thread_dir_pages.len() as u32);
        page.put_u32(24, self.reserve_dir_pages.len() as u32);
        page.put_u32(28, CKPT_HDR_VERSION);
        page.put_u64(32, self.sequence_number);
        page.put_u64(40, self.migrated_generation);
        page.put_u32(48, self.max_np_count);
        page.put_u32(52, self.log_tail.raw());
        page.put_u32(56, self.log_head.raw());
        page.put_u32(60, self.generation_hdrs.len() as u32);
        page.put_u64(64, self.time_of_demarc);

        let lids = self
            .generation_hdrs
            .iter()
            .map(|&lid| PackedLid::new(lid, LidTag::GenerationHdr))
            .chain(
                self.thread_dir_pages
                    .iter()
                    .map(|&lid| PackedLid::new(lid, LidTag::ThreadDir)),
            )
            .chain(
                self.reserve_dir_pages
                    .iter()
                    .map(|&lid| PackedLid::new(lid, LidTag::ReserveDir)),
            );
        put_lids(&mut page, ANCHOR_LIDS_AT, lids);
        seal(&mut page);
        Ok(page)
    }

    /// Decode and validate an anchor read from root slot `lid`.
    pub fn decode(page: &PageBuf, lid: Lid) -> StoreResult<Self> {
        const WHAT: &str = "checkpoint anchor";
        verify_seal(page, WHAT, lid)?;

        let version = page.get_u32(28);
        if version != CKPT_HDR_VERSION {
            return Err(StoreError::BadVersion {
                what: WHAT,
                found: version,
                expected: CKPT_HDR_VERSION,
            });
        }
        let sequence_number = page.get_u64(0);
        let check_sequence = page.get_u64(32);
        if sequence_number != check_sequence {
            return Err(StoreError::Malformed {
                what: WHAT,
                reason: format!(
                    "sequence number {sequence_number} disagrees with check sequence {check_sequence}"
                ),
            });
        }

        let n_thread = page.get_u32(20) as usize;
        let n_rsrv = page.get_u32(24) as usize;
        let n_gen = page.get_u32(60) as usize;
        let count = n_thread + n_rsrv + n_gen;
        if count > MAX_ANCHOR_LIDS {
            return Err(StoreError::TooManyEntries {
                what: WHAT,
                count,
                max: MAX_ANCHOR_LIDS,
            });
        }

        let mut at = ANCHOR_LIDS_AT;
        let generation_hdrs = get_lids(page, at, n_gen, LidTag::GenerationHdr, WHAT)?;
        at += n_gen * 4;
        let thread_dir_pages = get_lids(page, at, n_thread, LidTag::ThreadDir, WHAT)?;
        at += n_thread * 4;
        let reserve_dir_pages = get_lids(page, at, n_rsrv, LidTag::ReserveDir, WHAT)?;

        Ok(Self {
            sequence_number,
            has_migrated: page.as_bytes()[8] != 0,
            max_log_lid: lid_at(page, 12)?,
            migrated_generation: page.get_u64(40),
            n_dir_page: page.get_u32(16),
            max_np_count: page.get_u32(48),
            log_tail: lid_at(page, 52)?,
            log_head: lid_at(page, 56)?,
            time_of_demarc: page.get_u64(64),
            generation_hdrs,
            thread_dir_pages,
            reserve_dir_pages,
        })
    }
}

/// Header closing one generation in the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskGenerationHdr {
    pub generation: GenNum,
    /// First log frame written for this generation.
    pub first_lid: Lid,
    /// Last log frame written before this header.
    pub last_lid: Lid,
    pub time_of_demarc: u64,
    pub n_descriptors: u32,
    pub dir_pages: Vec<Lid>,
}

impl DiskGenerationHdr {
    pub fn encode(&self) -> StoreResult<PageBuf> {
        if self.dir_pages.len() > MAX_GENERATION_DIR_PAGES {
            return Err(StoreError::TooManyEntries {
                what: "generation header",
                count: self.dir_pages.len(),
                max: MAX_GENERATION_DIR_PAGES,
            });
        }
        let mut page = PageBuf::zeroed();
        page.put_u32(0, GENERATION_HDR_VERSION);
        page.put_u64(8, self.generation);
        page.put_u32(16, self.first_lid.raw());
        page.put_u32(20, self.last_lid.raw());
        page.put_u64(24, self.time_of_demarc);
        page.put_u32(32, self.dir_pages.len() as u32);
        page.put_u32(36, self.n_descriptors);
        put_lids(
            &mut page,
            GENERATION_LIDS_AT,
            self.dir_pages
                .iter()
                .map(|&lid| PackedLid::new(lid, LidTag::ObjectDir)),
        );
        seal(&mut page);
        Ok(page)
    }

    pub fn decode(page: &PageBuf, lid: Lid) -> StoreResult<Self> {
        const WHAT: &str = "generation header";
        verify_seal(page, WHAT, lid)?;
        let version = page.get_u32(0);
        if version != GENERATION_HDR_VERSION {
            return Err(StoreError::BadVersion {
                what: WHAT,
                found: version,
                expected: GENERATION_HDR_VERSION,
            });
        }
        let n_dir_page = page.get_u32(32) as usize;
        if n_dir_page > MAX_GENERATION_DIR_PAGES {
            return Err(StoreError::TooManyEntries {
                what: WHAT,
                count: n_dir_page,
                max: MAX_GENERATION_DIR_PAGES,
            });
        }
        Ok(Self {
            generation: page.get_u64(8),
            first_lid: lid_at(page, 16)?,
            last_lid: lid_at(page, 20)?,
            time_of_demarc: page.get_u64(24),
            n_descriptors: page.get_u32(36),
            dir_pages: get_lids(page, GENERATION_LIDS_AT, n_dir_page, LidTag::ObjectDir, WHAT)?,
        })
    }
}

/// A fixed-size record packed into a directory page.
pub trait DirEntryCodec: Sized {
    const SIZE: usize;
    const WHAT: &'static str;
    const PER_PAGE: usize = (SEAL_OFFSET - DIR_ENTRIES_AT) / Self::SIZE;

    fn encode_at(&self, page: &mut PageBuf, at: usize);
    fn decode_at(page: &PageBuf, at: usize) -> StoreResult<Self>;
}

/// Pack up to `E::PER_PAGE` entries into one sealed directory page.
pub fn encode_dir_page<E: DirEntryCodec>(entries: &[E]) -> StoreResult<PageBuf> {
    if entries.len() > E::PER_PAGE {
        return Err(StoreError::TooManyEntries {
            what: E::WHAT,
            count: entries.len(),
            max: E::PER_PAGE,
        });
    }
    let mut page = PageBuf::zeroed();
    page.put_u32(0, entries.len() as u32);
    for (i, entry) in entries.iter().enumerate() {
        entry.encode_at(&mut page, DIR_ENTRIES_AT + i * E::SIZE);
    }
    seal(&mut page);
    Ok(page)
}

pub fn decode_dir_page<E: DirEntryCodec>(page: &PageBuf, lid: Lid) -> StoreResult<Vec<E>> {
    verify_seal(page, E::WHAT, lid)?;
    let n = page.get_u32(0) as usize;
    if n > E::PER_PAGE {
        return Err(StoreError::TooManyEntries {
            what: E::WHAT,
            count: n,
            max: E::PER_PAGE,
        });
    }
    (0..n)
        .map(|i| E::decode_at(page, DIR_ENTRIES_AT + i * E::SIZE))
        .collect()
}

/// Location of one object version written to the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CkptDirent {
    pub oid: Oid,
    /// Allocation count for pages, max(alloc, call) for nodes.
    pub count: ObCount,
    pub lid: Lid,
    pub base_type: BaseType,
}

impl DirEntryCodec for CkptDirent {
    const SIZE: usize = 16;
    const WHAT: &'static str = "object directory page";

    fn encode_at(&self, page: &mut PageBuf, at: usize) {
        page.put_u64(at, self.oid.0);
        page.put_u32(at + 8, self.count);
        page.put_u32(
            at + 12,
            self.lid.raw() | ((self.base_type.nibble() as u32) << 28),
        );
    }

    fn decode_at(page: &PageBuf, at: usize) -> StoreResult<Self> {
        let word = page.get_u32(at + 12);
        let nibble = (word >> 28) as u8;
        let base_type =
            BaseType::from_nibble(nibble).ok_or(TypeError::UnknownBaseType(nibble))?;
        Ok(Self {
            oid: Oid(page.get_u64(at)),
            count: page.get_u32(at + 8),
            lid: Lid::new(word & MAX_LID_VALUE)?,
            base_type,
        })
    }
}

/// A process saved by a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadDirent {
    pub oid: Oid,
    pub alloc_count: ObCount,
    pub sched_ndx: u16,
    pub hazard: u8,
}

impl DirEntryCodec for ThreadDirent {
    const SIZE: usize = 16;
    const WHAT: &'static str = "thread directory page";

    fn encode_at(&self, page: &mut PageBuf, at: usize) {
        page.put_u64(at, self.oid.0);
        page.put_u32(at + 8, self.alloc_count);
        page.put_u16(at + 12, self.sched_ndx);
        page.as_bytes_mut()[at + 14] = self.hazard;
    }

    fn decode_at(page: &PageBuf, at: usize) -> StoreResult<Self> {
        Ok(Self {
            oid: Oid(page.get_u64(at)),
            alloc_count: page.get_u32(at + 8),
            sched_ndx: page.get_u16(at + 12),
            hazard: page.as_bytes()[at + 14],
        })
    }
}

/// A CPU reserve saved by a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReserveDirent {
    pub index: u16,
    pub priority: u8,
    pub active: bool,
    pub period_ns: u64,
    pub duration_ns: u64,
    pub quanta_ns: u64,
}

impl DirEntryCodec for ReserveDirent {
    const SIZE: usize = 32;
    const WHAT: &'static str = "reserve directory page";

    fn encode_at(&self, page: &mut PageBuf, at: usize) {
        page.put_u16(at, self.index);
        page.as_bytes_mut()[at + 2] = self.priority;
        page.as_bytes_mut()[at + 3] = self.active as u8;
        page.put_u64(at + 8, self.period_ns);
        page.put_u64(at + 16, self.duration_ns);
        page.put_u64(at + 24, self.quanta_ns);
    }

    fn decode_at(page: &PageBuf, at: usize) -> StoreResult<Self> {
        Ok(Self {
            index: page.get_u16(at),
            priority: page.as_bytes()[at + 2],
            active: page.as_bytes()[at + 3] != 0,
            period_ns: page.get_u64(at + 8),
            duration_ns: page.get_u64(at + 16),
            quanta_ns: page.get_u64(at + 24),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capros_types::{CKPT_ROOT_0, CKPT_ROOT_1, MAIN_LOG_START};

    fn lid(frame: u32) -> Lid {
        Lid::from_frame(frame).unwrap()
    }

    fn anchor() -> DiskCheckpointHdr {
        DiskCheckpointHdr {
            sequence_number: 9,
            has_migrated: false,
            max_log_lid: lid(512),
            migrated_generation: 7,
            n_dir_page: 3,
            max_np_count: 41,
            log_tail: lid(10),
            log_head: lid(30),
            time_of_demarc: 123_456,
            generation_hdrs: vec![lid(12), lid(20)],
            thread_dir_pages: vec![lid(21)],
            reserve_dir_pages: vec![lid(22), lid(23)],
        }
    }

    #[test]
    fn anchor_survives_encoding() {
        let page = anchor().encode().unwrap();
        assert_eq!(page.get_u64(32), 9, "check sequence mirrors the sequence number");
        assert_eq!(page.get_u32(72) >> 28, LidTag::GenerationHdr.nibble() as u32);
        assert_eq!(DiskCheckpointHdr::decode(&page, CKPT_ROOT_0).unwrap(), anchor());
    }

    #[test]
    fn never_written_anchor_is_rejected() {
        let page = PageBuf::zeroed();
        assert!(matches!(
            DiskCheckpointHdr::decode(&page, CKPT_ROOT_1),
            Err(StoreError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn torn_anchor_is_rejected() {
        let mut page = anchor().encode().unwrap();
        // Second half of the frame never reached the disk.
        page.as_bytes_mut()[2048..].fill(0);
        assert!(DiskCheckpointHdr::decode(&page, CKPT_ROOT_0).is_err());
    }

    #[test]
    fn sequence_mismatch_is_malformed() {
        let mut page = anchor().encode().unwrap();
        page.put_u64(32, 8);
        seal(&mut page);
        assert!(matches!(
            DiskCheckpointHdr::decode(&page, CKPT_ROOT_0),
            Err(StoreError::Malformed { .. })
        ));
    }

    #[test]
    fn anchor_capacity_is_enforced() {
        let mut hdr = anchor();
        hdr.thread_dir_pages = vec![MAIN_LOG_START; MAX_ANCHOR_LIDS];
        assert!(matches!(
            hdr.encode(),
            Err(StoreError::TooManyEntries { .. })
        ));
    }

    #[test]
    fn generation_header_lists_dir_pages() {
        let hdr = DiskGenerationHdr {
            generation: 4,
            first_lid: lid(40),
            last_lid: lid(44),
            time_of_demarc: 77,
            n_descriptors: 300,
            dir_pages: vec![lid(43), lid(44)],
        };
        let page = hdr.encode().unwrap();
        assert_eq!(DiskGenerationHdr::decode(&page, lid(45)).unwrap(), hdr);
    }

    #[test]
    fn directory_page_capacities() {
        assert_eq!(CkptDirent::PER_PAGE, 255);
        assert_eq!(ThreadDirent::PER_PAGE, 255);
        assert_eq!(ReserveDirent::PER_PAGE, 127);
    }

    #[test]
    fn object_dirents_pack_type_in_top_nibble() {
        let entries = vec![
            CkptDirent {
                oid: Oid(0x1000),
                count: 3,
                lid: lid(50),
                base_type: BaseType::Page,
            },
            CkptDirent {
                oid: Oid(0x2005),
                count: 1,
                lid: lid(51).with_index(5),
                base_type: BaseType::Node,
            },
        ];
        let page = encode_dir_page(&entries).unwrap();
        assert_eq!(page.get_u32(4 + 16 + 12) >> 28, 1);
        assert_eq!(decode_dir_page::<CkptDirent>(&page, lid(52)).unwrap(), entries);
    }

    #[test]
    fn full_directory_page_rejects_overflow() {
        let entry = ThreadDirent {
            oid: Oid(0x1000),
            alloc_count: 1,
            sched_ndx: 2,
            hazard: 0,
        };
        let entries = vec![entry; ThreadDirent::PER_PAGE + 1];
        assert!(encode_dir_page(&entries).is_err());
        assert!(encode_dir_page(&entries[1..]).is_ok());
    }

    #[test]
    fn reserve_entries_keep_their_fields() {
        let entries = vec![ReserveDirent {
            index: 3,
            priority: 9,
            active: true,
            period_ns: 10_000_000,
            duration_ns: 2_000_000,
            quanta_ns: 500_000,
        }];
        let page = encode_dir_page(&entries).unwrap();
        assert_eq!(decode_dir_page::<ReserveDirent>(&page, lid(60)).unwrap(), entries);
    }
}
