use std::collections::HashMap;
use std::sync::RwLock;

use capros_types::{Lid, Oid};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::home::HomeObject;
use crate::page::PageBuf;
use crate::traits::{HomeStore, LogDevice};

#[derive(Default)]
struct LogFrames {
    mounted: bool,
    durable: HashMap<u32, PageBuf>,
    /// Written since the last sync.
    pending: HashMap<u32, PageBuf>,
}

/// In-memory checkpoint log.
///
/// Keeps synced and unsynced frames apart so tests can drop everything
/// written since the last sync with [`InMemoryLogDevice::simulate_crash`].
pub struct InMemoryLogDevice {
    frames: u32,
    state: RwLock<LogFrames>,
}

impl InMemoryLogDevice {
    /// A mounted device with `frames` frames.
    pub fn new(frames: u32) -> Self {
        Self {
            frames,
            state: RwLock::new(LogFrames {
                mounted: true,
                ..LogFrames::default()
            }),
        }
    }

    /// A device that reports nothing mounted until [`Self::mount`].
    pub fn unmounted(frames: u32) -> Self {
        let dev = Self::new(frames);
        dev.state.write().expect("lock poisoned").mounted = false;
        dev
    }

    pub fn mount(&self) {
        self.state.write().expect("lock poisoned").mounted = true;
    }

    /// Forget every write issued since the last sync.
    pub fn simulate_crash(&self) {
        let mut state = self.state.write().expect("lock poisoned");
        let dropped = state.pending.len();
        state.pending.clear();
        debug!(dropped, "log device crash");
    }

    /// Flip one byte of a frame in place, bypassing sync.
    pub fn corrupt_byte(&self, lid: Lid, offset: usize) {
        let mut state = self.state.write().expect("lock poisoned");
        let frame = lid.frame();
        let mut page = state
            .pending
            .get(&frame)
            .or_else(|| state.durable.get(&frame))
            .cloned()
            .unwrap_or_default();
        page.as_bytes_mut()[offset] ^= 0xff;
        state.durable.insert(frame, page.clone());
        if state.pending.contains_key(&frame) {
            state.pending.insert(frame, page);
        }
    }

    /// Number of frames holding durable data.
    pub fn durable_frames(&self) -> usize {
        self.state.read().expect("lock poisoned").durable.len()
    }

    fn check(&self, state: &LogFrames, lid: Lid) -> StoreResult<()> {
        if !state.mounted {
            return Err(StoreError::NotMounted);
        }
        if lid.frame() >= self.frames {
            return Err(StoreError::FrameOutOfRange {
                lid,
                frames: self.frames,
            });
        }
        Ok(())
    }
}

impl LogDevice for InMemoryLogDevice {
    fn frame_count(&self) -> u32 {
        self.frames
    }

    fn is_mounted(&self, lid: Lid) -> bool {
        let state = self.state.read().expect("lock poisoned");
        state.mounted && lid.frame() < self.frames
    }

    fn read_frame(&self, lid: Lid) -> StoreResult<PageBuf> {
        let state = self.state.read().expect("lock poisoned");
        self.check(&state, lid)?;
        let frame = lid.frame();
        Ok(state
            .pending
            .get(&frame)
            .or_else(|| state.durable.get(&frame))
            .cloned()
            .unwrap_or_default())
    }

    fn write_frame(&self, lid: Lid, page: &PageBuf) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        self.check(&state, lid)?;
        state.pending.insert(lid.frame(), page.clone());
        Ok(())
    }

    fn sync(&self) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        let pending = std::mem::take(&mut state.pending);
        state.durable.extend(pending);
        Ok(())
    }
}

#[derive(Default)]
struct HomeObjects {
    durable: HashMap<Oid, HomeObject>,
    pending: HashMap<Oid, HomeObject>,
}

/// In-memory home store with the same crash model as [`InMemoryLogDevice`].
#[derive(Default)]
pub struct InMemoryHomeStore {
    state: RwLock<HomeObjects>,
}

impl InMemoryHomeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn simulate_crash(&self) {
        self.state.write().expect("lock poisoned").pending.clear();
    }

    /// Number of objects that would survive a crash.
    pub fn durable_len(&self) -> usize {
        self.state.read().expect("lock poisoned").durable.len()
    }

    /// All durable objects, sorted by OID.
    pub fn durable_objects(&self) -> Vec<HomeObject> {
        let state = self.state.read().expect("lock poisoned");
        let mut objects: Vec<HomeObject> = state.durable.values().cloned().collect();
        objects.sort_by_key(|obj| obj.oid);
        objects
    }
}

impl HomeStore for InMemoryHomeStore {
    fn read(&self, oid: Oid) -> StoreResult<Option<HomeObject>> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state
            .pending
            .get(&oid)
            .or_else(|| state.durable.get(&oid))
            .cloned())
    }

    fn write(&self, object: &HomeObject) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        state.pending.insert(object.oid, object.clone());
        Ok(())
    }

    fn sync(&self) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        let pending = std::mem::take(&mut state.pending);
        state.durable.extend(pending);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capros_types::{MAIN_LOG_START, CKPT_ROOT_0};

    #[test]
    fn unwritten_frames_read_as_zero() {
        let dev = InMemoryLogDevice::new(16);
        assert!(dev.read_frame(MAIN_LOG_START).unwrap().is_zero());
    }

    #[test]
    fn crash_drops_unsynced_writes() {
        let dev = InMemoryLogDevice::new(16);
        dev.write_frame(CKPT_ROOT_0, &PageBuf::filled(1)).unwrap();
        dev.sync().unwrap();
        dev.write_frame(CKPT_ROOT_0, &PageBuf::filled(2)).unwrap();
        dev.write_frame(MAIN_LOG_START, &PageBuf::filled(3)).unwrap();
        assert_eq!(dev.read_frame(CKPT_ROOT_0).unwrap(), PageBuf::filled(2));

        dev.simulate_crash();
        assert_eq!(dev.read_frame(CKPT_ROOT_0).unwrap(), PageBuf::filled(1));
        assert!(dev.read_frame(MAIN_LOG_START).unwrap().is_zero());
    }

    #[test]
    fn index_bits_share_a_frame() {
        let dev = InMemoryLogDevice::new(16);
        dev.write_frame(MAIN_LOG_START, &PageBuf::filled(7)).unwrap();
        assert_eq!(
            dev.read_frame(MAIN_LOG_START.with_index(4)).unwrap(),
            PageBuf::filled(7)
        );
    }

    #[test]
    fn out_of_range_and_unmounted() {
        let dev = InMemoryLogDevice::unmounted(4);
        assert!(!dev.is_mounted(CKPT_ROOT_0));
        assert!(matches!(
            dev.read_frame(CKPT_ROOT_0),
            Err(StoreError::NotMounted)
        ));
        dev.mount();
        assert!(dev.is_mounted(CKPT_ROOT_0));
        let far = Lid::from_frame(4).unwrap();
        assert!(!dev.is_mounted(far));
        assert!(matches!(
            dev.write_frame(far, &PageBuf::zeroed()),
            Err(StoreError::FrameOutOfRange { .. })
        ));
    }

    #[test]
    fn corrupt_byte_changes_durable_contents() {
        let dev = InMemoryLogDevice::new(16);
        dev.write_frame(MAIN_LOG_START, &PageBuf::filled(0xAA)).unwrap();
        dev.sync().unwrap();
        dev.corrupt_byte(MAIN_LOG_START, 10);
        let page = dev.read_frame(MAIN_LOG_START).unwrap();
        assert_eq!(page.as_bytes()[10], 0x55);
        assert_eq!(page.as_bytes()[11], 0xAA);
    }

    #[test]
    fn home_store_replaces_and_syncs() {
        let home = InMemoryHomeStore::new();
        let first = HomeObject::page(Oid(0x1000), 1, &PageBuf::filled(1));
        let second = HomeObject::page(Oid(0x1000), 2, &PageBuf::filled(2));
        home.write(&first).unwrap();
        home.sync().unwrap();
        home.write(&second).unwrap();
        assert_eq!(home.read(Oid(0x1000)).unwrap(), Some(second));

        home.simulate_crash();
        assert_eq!(home.read(Oid(0x1000)).unwrap(), Some(first));
        assert_eq!(home.durable_len(), 1);
        assert_eq!(home.read(Oid(0x2000)).unwrap(), None);
    }
}
