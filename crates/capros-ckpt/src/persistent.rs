use std::sync::{Arc, Mutex, MutexGuard};

use capros_cache::{CacheResult, FrameId, ObjectBody, ObjectCache, ObjectHeader, ObjectSource};
use capros_store::{
    DiskCheckpointHdr, DiskNode, HomeBody, HomeObject, HomeStore, LogDevice, NodeData, NodePot,
    PageBuf, StoreError,
};
use capros_types::{BaseType, GenNum, Lid, ObCount, ObType, ObjectFlags, Oid, ZERO_LID};
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::error::{PersistError, PersistResult};
use crate::log::{Generations, LogSpace};
use crate::logdir::{LogDirectory, ObjectDescriptor};

/// One version of an object, as read from the log or the home store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoredObject {
    Page { alloc_count: ObCount, page: PageBuf },
    Node(DiskNode),
}

impl StoredObject {
    /// What an OID that was never written holds.
    pub fn null(oid: Oid, base: BaseType) -> Self {
        match base {
            BaseType::Page => Self::Page {
                alloc_count: 0,
                page: PageBuf::zeroed(),
            },
            BaseType::Node => Self::Node(DiskNode {
                oid,
                alloc_count: 0,
                call_count: 0,
                data: NodeData::empty(),
            }),
        }
    }

    pub fn from_home(object: HomeObject) -> Self {
        match object.body {
            HomeBody::Page(bytes) => Self::Page {
                alloc_count: object.alloc_count,
                page: PageBuf::from_slice(&bytes),
            },
            HomeBody::Node(data) => Self::Node(DiskNode {
                oid: object.oid,
                alloc_count: object.alloc_count,
                call_count: object.call_count,
                data,
            }),
        }
    }

    pub fn into_home(self, oid: Oid) -> HomeObject {
        match self {
            Self::Page { alloc_count, page } => HomeObject::page(oid, alloc_count, &page),
            Self::Node(node) => HomeObject::node(oid, node.alloc_count, node.call_count, node.data),
        }
    }

    pub fn base_type(&self) -> BaseType {
        match self {
            Self::Page { .. } => BaseType::Page,
            Self::Node(_) => BaseType::Node,
        }
    }

    pub fn alloc_count(&self) -> ObCount {
        match self {
            Self::Page { alloc_count, .. } => *alloc_count,
            Self::Node(node) => node.alloc_count,
        }
    }
}

/// Mutable state shared by the persistent source and the engines.
#[derive(Debug)]
pub struct StoreState {
    pub directory: LogDirectory,
    pub space: LogSpace,
    pub gens: Generations,
    /// Node pot being filled; its frame is already allocated.
    pending_pot: Option<(Lid, NodePot)>,
    pub restart_done: bool,
    reserve_frames: u32,
}

impl StoreState {
    pub fn append_page(&mut self, log: &dyn LogDevice, page: &PageBuf) -> PersistResult<Lid> {
        let lid = self.space.next_log_loc()?;
        log.write_frame(lid, page)?;
        Ok(lid)
    }

    /// Add a node to the open pot, starting one if needed. A full pot is
    /// written at once.
    pub fn append_node(&mut self, log: &dyn LogDevice, node: DiskNode) -> PersistResult<Lid> {
        let (pot_lid, pot) = match self.pending_pot.take() {
            Some(open) => open,
            None => (self.space.next_log_loc()?, NodePot::new()),
        };
        let mut pot = pot;
        let index = pot.push(node)?;
        let full = pot.is_full();
        self.pending_pot = Some((pot_lid, pot));
        if full {
            self.flush_pot(log)?;
        }
        Ok(pot_lid.with_index(index))
    }

    /// Write the open node pot, if any.
    pub fn flush_pot(&mut self, log: &dyn LogDevice) -> PersistResult<()> {
        if let Some((lid, pot)) = self.pending_pot.take() {
            log.write_frame(lid, &pot.encode())?;
            debug!(%lid, nodes = pot.len(), "wrote node pot");
        }
        Ok(())
    }

    pub fn has_pending_pot(&self) -> bool {
        self.pending_pot.is_some()
    }

    /// Write the current contents of `hdr` to the log as part of
    /// `generation` and record the new location.
    pub fn write_object(
        &mut self,
        log: &dyn LogDevice,
        hdr: &ObjectHeader,
        generation: GenNum,
    ) -> PersistResult<ObjectDescriptor> {
        self.directory.check_room(hdr.oid, generation)?;
        let (base_type, log_loc) = match &hdr.body {
            ObjectBody::Page(page) if page.is_zero() => (BaseType::Page, ZERO_LID),
            ObjectBody::Page(page) => (BaseType::Page, self.append_page(log, page)?),
            ObjectBody::Node(data) => {
                let node = DiskNode {
                    oid: hdr.oid,
                    alloc_count: hdr.alloc_count,
                    call_count: hdr.call_count,
                    data: data.clone(),
                };
                (BaseType::Node, self.append_node(log, node)?)
            }
        };
        let od = ObjectDescriptor {
            oid: hdr.oid,
            alloc_count: hdr.alloc_count,
            call_count: if base_type == BaseType::Node { hdr.call_count } else { 0 },
            log_loc,
            base_type,
        };
        self.directory.record_location(od, generation)?;
        Ok(od)
    }

    /// Read the version `od` describes.
    pub fn read_logged(&self, log: &dyn LogDevice, od: &ObjectDescriptor) -> PersistResult<StoredObject> {
        if od.log_loc == ZERO_LID {
            return Ok(match od.base_type {
                BaseType::Page => StoredObject::Page {
                    alloc_count: od.alloc_count,
                    page: PageBuf::zeroed(),
                },
                BaseType::Node => StoredObject::Node(DiskNode {
                    oid: od.oid,
                    alloc_count: od.alloc_count,
                    call_count: od.call_count,
                    data: NodeData::empty(),
                }),
            });
        }
        match od.base_type {
            BaseType::Page => Ok(StoredObject::Page {
                alloc_count: od.alloc_count,
                page: log.read_frame(od.log_loc)?,
            }),
            BaseType::Node => {
                let node = match &self.pending_pot {
                    Some((lid, pot)) if lid.frame() == od.log_loc.frame() => pot
                        .nodes
                        .get(od.log_loc.index() as usize)
                        .cloned()
                        .ok_or_else(|| StoreError::Malformed {
                            what: "node pot",
                            reason: format!("{} is not in the open pot", od.log_loc),
                        })?,
                    _ => NodePot::node_at(&log.read_frame(od.log_loc)?, od.log_loc)?,
                };
                if node.oid != od.oid {
                    return Err(StoreError::Malformed {
                        what: "node pot",
                        reason: format!("{} holds {}, expected {}", od.log_loc, node.oid, od.oid),
                    }
                    .into());
                }
                Ok(StoredObject::Node(node))
            }
        }
    }

    /// Frames still free for ordinary cleaning.
    pub fn cleaning_headroom(&self) -> u32 {
        self.space.available().saturating_sub(self.reserve_frames)
    }

    /// Advance the log tail to the oldest frame still needed.
    pub fn reclaim(&mut self) -> PersistResult<()> {
        self.gens.prune();
        let tail = self.gens.log_tail();
        self.space.set_tail(tail)?;
        Ok(())
    }
}

/// The checkpoint log, the home store and the bookkeeping over both.
pub struct PersistentStore {
    log: Arc<dyn LogDevice>,
    home: Arc<dyn HomeStore>,
    state: Mutex<StoreState>,
}

impl PersistentStore {
    pub fn new(
        log: Arc<dyn LogDevice>,
        home: Arc<dyn HomeStore>,
        config: &CoreConfig,
    ) -> PersistResult<Self> {
        let space = LogSpace::new(log.frame_count())?;
        Ok(Self {
            state: Mutex::new(StoreState {
                directory: LogDirectory::new(config.directory_capacity, config.max_generations),
                space,
                gens: Generations::big_bang(),
                pending_pot: None,
                restart_done: false,
                reserve_frames: config.checkpoint_reserve_frames,
            }),
            log,
            home,
        })
    }

    pub fn log(&self) -> &dyn LogDevice {
        self.log.as_ref()
    }

    pub fn home(&self) -> &dyn HomeStore {
        self.home.as_ref()
    }

    pub fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().expect("lock poisoned")
    }

    pub fn is_restart_done(&self) -> bool {
        self.state().restart_done
    }

    /// Newest durable version of `oid`, or the null object if it was never
    /// written. `Ok(None)` if the stored object is the other base type.
    pub fn fetch(&self, oid: Oid, base: BaseType) -> PersistResult<Option<StoredObject>> {
        let state = self.state();
        if !state.restart_done {
            return Err(PersistError::RestartNotDone);
        }
        if let Some(od) = state.directory.find_object(oid).copied() {
            if od.base_type != base {
                warn!(%oid, logged = %od.base_type, requested = %base, "logged object has other type");
                return Ok(None);
            }
            return state.read_logged(self.log(), &od).map(Some);
        }
        drop(state);

        match self.home.read(oid)? {
            Some(object) if object.base_type() != base => {
                warn!(%oid, home = %object.base_type(), requested = %base, "home object has other type");
                Ok(None)
            }
            Some(object) => Ok(Some(StoredObject::from_home(object))),
            None => Ok(Some(StoredObject::null(oid, base))),
        }
    }

    /// Write `hdr` to the next free slot of the alternate anchor frame and
    /// make it durable. The log itself must already be synced.
    pub fn write_anchor(&self, state: &mut StoreState, hdr: &DiskCheckpointHdr) -> PersistResult<Lid> {
        let root = state.gens.root.other_root();
        self.log.write_frame(root, &hdr.encode()?)?;
        self.log.sync()?;
        state.gens.root = root;
        info!(
            %root,
            sequence = hdr.sequence_number,
            migrated = hdr.migrated_generation,
            head = %hdr.log_head,
            tail = %hdr.log_tail,
            "anchor written"
        );
        Ok(root)
    }
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore").finish_non_exhaustive()
    }
}

/// Object source for the persistent OID range.
///
/// Objects come from the log while the log directory knows them, then from
/// the home store. An OID never written comes up as a zero page or an empty
/// node with allocation count zero.
pub struct PersistentObjectSource {
    store: Arc<PersistentStore>,
}

impl PersistentObjectSource {
    pub fn new(store: Arc<PersistentStore>) -> Self {
        Self { store }
    }
}

impl ObjectSource for PersistentObjectSource {
    fn name(&self) -> &'static str {
        "persistent store"
    }

    fn get_object(
        &self,
        cache: &mut ObjectCache,
        oid: Oid,
        base: BaseType,
        count: ObCount,
        use_count: bool,
    ) -> CacheResult<Option<FrameId>> {
        let Some(stored) = self.store.fetch(oid, base)? else {
            return Ok(None);
        };
        if use_count && stored.alloc_count() != count {
            debug!(%oid, have = stored.alloc_count(), want = count, "stale count; not fetched");
            return Ok(None);
        }
        let frame = match stored {
            StoredObject::Page { alloc_count, page } => {
                let frame = cache.grab_page_frame()?;
                cache.install_page(
                    frame,
                    oid,
                    alloc_count,
                    ObType::PtDataPage,
                    page,
                    ObjectFlags::CLEANABLE,
                )?;
                frame
            }
            StoredObject::Node(node) => {
                let frame = cache.grab_node_frame()?;
                cache.install_node(
                    frame,
                    oid,
                    node.alloc_count,
                    node.call_count,
                    node.data,
                    ObjectFlags::CLEANABLE,
                )?;
                frame
            }
        };
        debug!(%oid, %base, ?frame, "fetched persistent object");
        Ok(Some(frame))
    }

    fn write_back(&self, cache: &mut ObjectCache, frame: FrameId) -> CacheResult<bool> {
        let hdr = cache.header(frame);
        if !hdr.oid.is_persistent() {
            return Ok(false);
        }
        let frozen = hdr.is_frozen();
        if cache.checkpoint_active() && !frozen {
            return Ok(false);
        }
        let working_copy = !hdr.is_current();

        let mut state = self.store.state();
        if !state.restart_done {
            return Ok(false);
        }
        if !frozen && state.cleaning_headroom() == 0 {
            debug!(oid = %hdr.oid, available = state.space.available(), "log space reserved for checkpoint");
            return Ok(false);
        }
        let generation = state.gens.working;
        match state.write_object(self.store.log(), hdr, generation) {
            Ok(_) => {}
            Err(
                e @ (PersistError::LogFull
                | PersistError::DirectoryFull { .. }
                | PersistError::TooManyGenerations { .. }),
            ) => {
                warn!(oid = %hdr.oid, error = %e, "cannot clean object now");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        drop(state);

        if working_copy {
            cache.release_frame(frame);
        } else {
            cache.mark_clean(frame);
        }
        Ok(true)
    }
}
