use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use capros_types::{Lid, Oid, PAGE_SIZE};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::home::HomeObject;
use crate::page::PageBuf;
use crate::traits::{HomeStore, LogDevice};

/// Checkpoint log backed by a single file, one frame every 4096 bytes.
///
/// The file is extended to its full size on open, so unwritten frames read
/// back as zeros.
pub struct FileLogDevice {
    path: PathBuf,
    frames: u32,
    file: Mutex<File>,
}

impl FileLogDevice {
    pub fn open(path: &Path, frames: u32) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let want = frames as u64 * PAGE_SIZE as u64;
        if file.metadata()?.len() < want {
            file.set_len(want)?;
        }
        debug!(path = %path.display(), frames, "opened log file");
        Ok(Self {
            path: path.to_path_buf(),
            frames,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset(&self, lid: Lid) -> StoreResult<u64> {
        if lid.frame() >= self.frames {
            return Err(StoreError::FrameOutOfRange {
                lid,
                frames: self.frames,
            });
        }
        Ok(lid.frame() as u64 * PAGE_SIZE as u64)
    }
}

impl LogDevice for FileLogDevice {
    fn frame_count(&self) -> u32 {
        self.frames
    }

    fn is_mounted(&self, lid: Lid) -> bool {
        lid.frame() < self.frames
    }

    fn read_frame(&self, lid: Lid) -> StoreResult<PageBuf> {
        let offset = self.offset(lid)?;
        let mut file = self.file.lock().expect("lock poisoned");
        file.seek(SeekFrom::Start(offset))?;
        let mut page = PageBuf::zeroed();
        file.read_exact(page.as_bytes_mut())?;
        Ok(page)
    }

    fn write_frame(&self, lid: Lid, page: &PageBuf) -> StoreResult<()> {
        let offset = self.offset(lid)?;
        let mut file = self.file.lock().expect("lock poisoned");
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(page.as_bytes())?;
        Ok(())
    }

    fn sync(&self) -> StoreResult<()> {
        self.file.lock().expect("lock poisoned").sync_all()?;
        Ok(())
    }
}

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: u64 = 8;

/// Default share of dead bytes, in percent, above which `sync` compacts.
pub const DEFAULT_COMPACT_PERCENT: u8 = 50;

/// Where one framed record sits in the file, header included.
#[derive(Clone, Copy, Debug)]
struct Record {
    offset: u64,
    len: u64,
}

struct HomeFile {
    writer: BufWriter<File>,
    offset: u64,
    /// Latest record for each OID.
    index: HashMap<Oid, Record>,
    /// Bytes held by the records in `index`.
    live: u64,
}

impl HomeFile {
    fn dead(&self) -> u64 {
        self.offset - self.live
    }
}

/// Home store kept as an append-only record file.
///
/// Each record is framed as:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized HomeObject)]
/// ```
/// The latest record for an OID wins. On open the file is scanned front to
/// back to rebuild the index; a torn record at the tail is cut off.
///
/// Superseded records are dropped by [`compact`](Self::compact), which
/// [`HomeStore::sync`] runs once dead bytes pass the compaction threshold.
pub struct FileHomeStore {
    path: PathBuf,
    compact_percent: u8,
    state: Mutex<HomeFile>,
}

impl FileHomeStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let (index, valid_end) = Self::scan(path)?;
        let file_len = file.metadata()?.len();
        if valid_end < file_len {
            warn!(valid_end, file_len, "discarding torn home store tail");
            file.set_len(valid_end)?;
        }
        let live = index.values().map(|r| r.len).sum();
        debug!(objects = index.len(), live, path = %path.display(), "opened home store");

        Ok(Self {
            path: path.to_path_buf(),
            compact_percent: DEFAULT_COMPACT_PERCENT,
            state: Mutex::new(HomeFile {
                writer: BufWriter::new(file),
                offset: valid_end,
                index,
                live,
            }),
        })
    }

    /// Compact on `sync` once dead bytes exceed `percent` of the file.
    /// `100` never compacts automatically.
    pub fn with_compact_percent(mut self, percent: u8) -> Self {
        self.compact_percent = percent.min(100);
        self
    }

    /// Bytes taken by superseded records.
    pub fn dead_bytes(&self) -> u64 {
        self.state.lock().expect("lock poisoned").dead()
    }

    /// Rewrite the file with only the latest record of each OID.
    ///
    /// Live records are copied to a side file, which is synced and then
    /// renamed over the store. A crash before the rename leaves the old
    /// file intact.
    pub fn compact(&self) -> StoreResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        self.compact_locked(&mut state)
    }

    fn compact_locked(&self, state: &mut HomeFile) -> StoreResult<()> {
        state.writer.flush()?;
        let before = state.offset;
        let mut records: Vec<(Oid, Record)> =
            state.index.iter().map(|(&oid, &r)| (oid, r)).collect();
        records.sort_by_key(|(_, r)| r.offset);

        let side = self.path.with_extension("compact");
        let mut source = File::open(&self.path)?;
        let mut out = BufWriter::new(File::create(&side)?);
        let mut index = HashMap::with_capacity(records.len());
        let mut offset = 0u64;
        let mut buf = Vec::new();
        for (oid, record) in records {
            source.seek(SeekFrom::Start(record.offset))?;
            buf.resize(record.len as usize, 0);
            source.read_exact(&mut buf)?;
            out.write_all(&buf)?;
            index.insert(oid, Record { offset, len: record.len });
            offset += record.len;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);

        fs::rename(&side, &self.path)?;
        #[cfg(unix)]
        {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                File::open(parent)?.sync_all()?;
            }
        }
        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        state.writer = BufWriter::new(file);
        state.offset = offset;
        state.live = offset;
        state.index = index;
        debug!(before, after = offset, objects = state.index.len(), "compacted home store");
        Ok(())
    }

    /// Number of distinct objects stored.
    pub fn len(&self) -> usize {
        self.state.lock().expect("lock poisoned").index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn scan(path: &Path) -> StoreResult<(HashMap<Oid, Record>, u64)> {
        let mut reader = BufReader::new(File::open(path)?);
        let file_len = reader.get_ref().metadata()?.len();
        let mut index = HashMap::new();
        let mut offset = 0u64;

        while offset + HEADER_SIZE <= file_len {
            let (length, expected_crc) = match read_header(&mut reader) {
                Ok(header) => header,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            if length == 0 || offset + HEADER_SIZE + length as u64 > file_len {
                warn!(offset, length, file_len, "invalid record length; stopping scan");
                break;
            }
            let mut payload = vec![0u8; length as usize];
            reader.read_exact(&mut payload)?;

            let actual_crc = crc32fast::hash(&payload);
            if actual_crc != expected_crc {
                warn!(
                    offset,
                    expected = expected_crc,
                    actual = actual_crc,
                    "CRC mismatch; stopping scan"
                );
                break;
            }
            match bincode::deserialize::<HomeObject>(&payload) {
                Ok(object) => {
                    let len = HEADER_SIZE + length as u64;
                    index.insert(object.oid, Record { offset, len });
                }
                Err(e) => {
                    warn!(offset, error = %e, "undecodable record; stopping scan");
                    break;
                }
            }
            offset += HEADER_SIZE + length as u64;
        }
        Ok((index, offset))
    }

    fn read_at(&self, offset: u64) -> StoreResult<HomeObject> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let (length, expected_crc) = read_header(&mut file)?;
        let mut payload = vec![0u8; length as usize];
        file.read_exact(&mut payload)?;
        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            return Err(StoreError::Malformed {
                what: "home store record",
                reason: format!(
                    "CRC mismatch at offset {offset}: expected {expected_crc:#010x}, got {actual_crc:#010x}"
                ),
            });
        }
        bincode::deserialize(&payload).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

fn read_header(reader: &mut impl Read) -> io::Result<(u32, u32)> {
    let mut header = [0u8; HEADER_SIZE as usize];
    reader.read_exact(&mut header)?;
    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    Ok((length, crc))
}

impl HomeStore for FileHomeStore {
    fn read(&self, oid: Oid) -> StoreResult<Option<HomeObject>> {
        // Held across the read so a compaction cannot move the record.
        let state = self.state.lock().expect("lock poisoned");
        match state.index.get(&oid) {
            Some(record) => self.read_at(record.offset).map(Some),
            None => Ok(None),
        }
    }

    fn write(&self, object: &HomeObject) -> StoreResult<()> {
        let payload =
            bincode::serialize(object).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let length = payload.len() as u32;
        let crc = crc32fast::hash(&payload);

        let mut state = self.state.lock().expect("lock poisoned");
        let record_offset = state.offset;
        state.writer.write_all(&length.to_le_bytes())?;
        state.writer.write_all(&crc.to_le_bytes())?;
        state.writer.write_all(&payload)?;
        state.writer.flush()?;

        let len = HEADER_SIZE + payload.len() as u64;
        state.offset += len;
        state.live += len;
        let record = Record {
            offset: record_offset,
            len,
        };
        if let Some(old) = state.index.insert(object.oid, record) {
            state.live -= old.len;
        }
        debug!(oid = %object.oid, offset = record_offset, "home store write");
        Ok(())
    }

    fn sync(&self) -> StoreResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.writer.flush()?;
        state.writer.get_ref().sync_all()?;
        if state.dead() * 100 > state.offset * u64::from(self.compact_percent) {
            self.compact_locked(&mut state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{KeySlot, KeyType, NodeData};
    use capros_types::{CKPT_ROOT_1, MAIN_LOG_START};

    #[test]
    fn log_file_frames_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.img");
        {
            let dev = FileLogDevice::open(&path, 8).unwrap();
            dev.write_frame(CKPT_ROOT_1, &PageBuf::filled(0x5A)).unwrap();
            dev.sync().unwrap();
        }
        let dev = FileLogDevice::open(&path, 8).unwrap();
        assert_eq!(dev.read_frame(CKPT_ROOT_1).unwrap(), PageBuf::filled(0x5A));
        assert!(dev.read_frame(MAIN_LOG_START).unwrap().is_zero());
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            8 * PAGE_SIZE as u64
        );
    }

    #[test]
    fn log_file_rejects_frames_past_end() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileLogDevice::open(&dir.path().join("log.img"), 2).unwrap();
        assert!(!dev.is_mounted(MAIN_LOG_START));
        assert!(dev.read_frame(MAIN_LOG_START).is_err());
    }

    #[test]
    fn home_file_keeps_latest_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("home.dat");
        let mut data = NodeData::empty();
        data.slots[4] = KeySlot::new(KeyType::Page, Oid(0x1000), 2);
        {
            let home = FileHomeStore::open(&path).unwrap();
            home.write(&HomeObject::page(Oid(0x1000), 1, &PageBuf::filled(1)))
                .unwrap();
            home.write(&HomeObject::page(Oid(0x1000), 2, &PageBuf::filled(2)))
                .unwrap();
            home.write(&HomeObject::node(Oid(0x2001), 3, 4, data.clone()))
                .unwrap();
            home.sync().unwrap();
            assert_eq!(home.len(), 2);
        }

        let home = FileHomeStore::open(&path).unwrap();
        let page = home.read(Oid(0x1000)).unwrap().unwrap();
        assert_eq!(page.alloc_count, 2);
        assert_eq!(page.page_buf(), Some(PageBuf::filled(2)));
        let node = home.read(Oid(0x2001)).unwrap().unwrap();
        assert_eq!(node, HomeObject::node(Oid(0x2001), 3, 4, data));
        assert_eq!(home.read(Oid(0x3000)).unwrap(), None);
    }

    #[test]
    fn torn_tail_is_discarded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("home.dat");
        {
            let home = FileHomeStore::open(&path).unwrap();
            home.write(&HomeObject::page(Oid(0x1000), 1, &PageBuf::filled(1)))
                .unwrap();
            home.sync().unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[200, 0, 0, 0, 1, 2, 3, 4, 9, 9]).unwrap();
        }

        let home = FileHomeStore::open(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        assert_eq!(home.len(), 1);
        home.write(&HomeObject::page(Oid(0x2000), 1, &PageBuf::filled(3)))
            .unwrap();
        drop(home);

        let home = FileHomeStore::open(&path).unwrap();
        assert_eq!(home.len(), 2);
    }

    #[test]
    fn sync_compacts_superseded_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("home.dat");
        let home = FileHomeStore::open(&path).unwrap();
        home.write(&HomeObject::page(Oid(0x2000), 1, &PageBuf::filled(0xEE)))
            .unwrap();
        home.write(&HomeObject::page(Oid(0x1000), 1, &PageBuf::filled(0)))
            .unwrap();
        home.sync().unwrap();
        let two_records = fs::metadata(&path).unwrap().len();

        for round in 1..=40u8 {
            home.write(&HomeObject::page(Oid(0x1000), 1, &PageBuf::filled(round)))
                .unwrap();
            home.sync().unwrap();
            // Never more than the live records plus as many dead ones.
            assert!(fs::metadata(&path).unwrap().len() <= 2 * two_records);
        }
        home.compact().unwrap();
        assert_eq!(home.dead_bytes(), 0);
        assert_eq!(fs::metadata(&path).unwrap().len(), two_records);
        assert!(!path.with_extension("compact").exists());

        // Appends after a compaction land in the new file.
        home.write(&HomeObject::page(Oid(0x3000), 1, &PageBuf::filled(3)))
            .unwrap();
        home.sync().unwrap();
        drop(home);

        let home = FileHomeStore::open(&path).unwrap();
        assert_eq!(home.len(), 3);
        assert_eq!(
            home.read(Oid(0x1000)).unwrap().unwrap().page_buf(),
            Some(PageBuf::filled(40))
        );
        assert_eq!(
            home.read(Oid(0x2000)).unwrap().unwrap().page_buf(),
            Some(PageBuf::filled(0xEE))
        );
    }

    #[test]
    fn compaction_threshold_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("home.dat");
        let home = FileHomeStore::open(&path).unwrap().with_compact_percent(100);
        for round in 0..5u8 {
            home.write(&HomeObject::page(Oid(0x1000), 1, &PageBuf::filled(round)))
                .unwrap();
            home.sync().unwrap();
        }
        assert!(home.dead_bytes() > 0);
        assert_eq!(home.len(), 1);
    }
}
