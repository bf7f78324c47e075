use std::sync::Arc;

use capros_cache::{
    check_consistency, FrameId, HolderId, ObjectCache, ObjectSource, PhysMem, PhysPageSource,
    PreloadImage, PreloadObjectSource,
};
use capros_store::{HomeStore, LogDevice, NodeData, PageBuf};
use capros_types::{
    BaseType, GenNum, ObCount, Oid, OidRange, FIRST_PERSISTENT_OID, OID_RESERVED_PHYSRANGE,
};
use tracing::{debug, info};

use crate::checkpoint::{CheckpointEngine, CheckpointPhase};
use crate::config::CoreConfig;
use crate::context::StepContext;
use crate::error::{PersistError, PersistResult};
use crate::migration::MigrationEngine;
use crate::persistent::{PersistentObjectSource, PersistentStore};
use crate::process::{ProcessTable, ReserveTable};
use crate::queue::{ActivityId, QueueId, StepOutcome, WaitQueues};
use crate::restart::{RestartEngine, RestartPhase};

/// The three engines the migrator activity drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigratorOp {
    RestartStep,
    MigrationStep,
    CheckpointStep,
}

/// Where the generation counters stand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationInfo {
    pub working: GenNum,
    pub stabilized: GenNum,
    pub migrated: GenNum,
    /// Migrated generation recorded in the newest anchor.
    pub durable_migrated: GenNum,
}

/// The persistence core: object cache, object sources and the restart,
/// checkpoint and migration engines over one log and one home store.
pub struct KernelCore {
    config: CoreConfig,
    cache: ObjectCache,
    store: Arc<PersistentStore>,
    physpages: Arc<PhysPageSource>,
    preload: Option<Arc<PreloadObjectSource>>,
    checkpoint: CheckpointEngine,
    migration: MigrationEngine,
    restart: RestartEngine,
    queues: WaitQueues,
    processes: ProcessTable,
    reserves: ReserveTable,
    clock: u64,
}

impl KernelCore {
    /// Assemble the core. Nothing is read from the devices until restart
    /// runs.
    ///
    /// A boot image in the persistent range is only accepted for a big
    /// bang; its objects are loaded once restart is done and reach the log
    /// with the first checkpoint.
    pub fn new(
        config: CoreConfig,
        log: Arc<dyn LogDevice>,
        home: Arc<dyn HomeStore>,
        preload: Option<PreloadImage>,
    ) -> PersistResult<Self> {
        config.validate()?;
        let pmem = PhysMem::new(config.memory.clone())?;
        let mut cache = ObjectCache::new(config.cache.clone(), pmem.clone());

        let physpages = Arc::new(PhysPageSource::new(pmem)?);
        cache.add_range(physpages.range(), physpages.clone())?;

        let preload = preload
            .map(PreloadObjectSource::new)
            .transpose()?
            .map(Arc::new);
        if let Some(source) = &preload {
            if source.is_persistent() {
                if !config.big_bang {
                    return Err(PersistError::Config(format!(
                        "boot image at {} is in the persistent range but big_bang is off",
                        source.range()
                    )));
                }
            } else {
                cache.add_range(source.range(), source.clone())?;
            }
        }

        let store = Arc::new(PersistentStore::new(log, home, &config)?);
        let persistent: Arc<dyn ObjectSource> =
            Arc::new(PersistentObjectSource::new(store.clone()));
        let whole = OidRange::new(FIRST_PERSISTENT_OID, OID_RESERVED_PHYSRANGE)?;
        for range in subtract(whole, cache_ranges(&cache)) {
            cache.add_range(range, persistent.clone())?;
        }

        info!(
            frames = cache.frame_count(),
            log_frames = store.log().frame_count(),
            big_bang = config.big_bang,
            "persistence core assembled"
        );
        Ok(Self {
            config,
            cache,
            store,
            physpages,
            preload,
            checkpoint: CheckpointEngine::new(),
            migration: MigrationEngine::new(),
            restart: RestartEngine::new(),
            queues: WaitQueues::new(),
            processes: ProcessTable::new(),
            reserves: ReserveTable::new(),
            clock: 0,
        })
    }

    fn split(
        &mut self,
    ) -> (
        &mut CheckpointEngine,
        &mut MigrationEngine,
        &mut RestartEngine,
        StepContext<'_>,
    ) {
        let Self {
            config,
            cache,
            store,
            preload,
            checkpoint,
            migration,
            restart,
            queues,
            processes,
            reserves,
            clock,
            ..
        } = self;
        let ctx = StepContext {
            config,
            cache,
            store: &**store,
            queues,
            processes,
            reserves,
            preload: preload.as_deref(),
            now: *clock,
        };
        (checkpoint, migration, restart, ctx)
    }

    // ---- Engines ----

    /// One step of the engine named by `op`.
    pub fn migrator_tool(&mut self, op: MigratorOp) -> PersistResult<StepOutcome> {
        match op {
            MigratorOp::RestartStep => self.restart_step(),
            MigratorOp::MigrationStep => self.migration_step(),
            MigratorOp::CheckpointStep => self.do_checkpoint_step(),
        }
    }

    pub fn restart_step(&mut self) -> PersistResult<StepOutcome> {
        let (outcome, finished) = {
            let (_, _, restart, mut ctx) = self.split();
            let was_done = restart.is_done();
            let outcome = restart.step(&mut ctx)?;
            (outcome, !was_done && restart.is_done())
        };
        if finished {
            self.after_restart()?;
        }
        Ok(outcome)
    }

    fn after_restart(&mut self) -> PersistResult<()> {
        if !self.config.big_bang {
            return Ok(());
        }
        if let Some(source) = self.preload.as_ref().filter(|s| s.is_persistent()) {
            let loaded = source.preload_all(&mut self.cache)?;
            info!(objects = loaded, range = %source.range(), "big bang image loaded");
        }
        Ok(())
    }

    /// Step restart until it is done.
    pub fn run_restart(&mut self) -> PersistResult<()> {
        loop {
            match self.restart_step()? {
                StepOutcome::Done => return Ok(()),
                StepOutcome::Blocked(queue) => return Err(PersistError::Stalled(queue)),
                StepOutcome::Progress | StepOutcome::Idle => {}
            }
        }
    }

    pub fn restart_phase(&self) -> RestartPhase {
        self.restart.phase()
    }

    pub fn restart_is_done(&self) -> bool {
        self.restart.is_done()
    }

    /// Put `activity` to sleep until restart is done. Returns whether it
    /// may proceed now.
    pub fn wait_for_restart(&mut self, activity: ActivityId) -> bool {
        if self.restart.is_done() {
            return true;
        }
        self.queues.sleep_on(QueueId::RestartQueue, activity);
        false
    }

    /// Ask for a checkpoint. Returns false if one is already running.
    pub fn declare_demarcation_event(&mut self) -> bool {
        let (checkpoint, _, _, mut ctx) = self.split();
        checkpoint.declare_demarcation_event(&mut ctx)
    }

    pub fn do_checkpoint_step(&mut self) -> PersistResult<StepOutcome> {
        let (checkpoint, _, _, mut ctx) = self.split();
        checkpoint.step(&mut ctx)
    }

    /// Take a checkpoint to completion, migrating whenever the log is too
    /// full to hold it.
    pub fn run_checkpoint(&mut self) -> PersistResult<()> {
        self.declare_demarcation_event();
        while self.checkpoint.is_active() {
            match self.do_checkpoint_step()? {
                StepOutcome::Blocked(QueueId::WaitForLogSpace) => {
                    if self.migration_step()? == StepOutcome::Idle {
                        return Err(PersistError::Stalled(QueueId::WaitForLogSpace));
                    }
                }
                StepOutcome::Blocked(queue) => return Err(PersistError::Stalled(queue)),
                StepOutcome::Progress | StepOutcome::Idle | StepOutcome::Done => {}
            }
        }
        Ok(())
    }

    pub fn checkpoint_phase(&self) -> CheckpointPhase {
        self.checkpoint.phase()
    }

    pub fn checkpoints_completed(&self) -> u64 {
        self.checkpoint.completed()
    }

    pub fn migration_step(&mut self) -> PersistResult<StepOutcome> {
        let phase = self.checkpoint.phase();
        let (_, migration, _, mut ctx) = self.split();
        migration.step(&mut ctx, phase)
    }

    /// Migrate until nothing is left to copy or record.
    pub fn run_migration(&mut self) -> PersistResult<()> {
        loop {
            match self.migration_step()? {
                StepOutcome::Idle | StepOutcome::Done => return Ok(()),
                StepOutcome::Blocked(queue) => return Err(PersistError::Stalled(queue)),
                StepOutcome::Progress => {}
            }
        }
    }

    pub fn objects_migrated(&self) -> u64 {
        self.migration.objects_migrated()
    }

    /// Whether the log has filled past the configured limit.
    pub fn needs_checkpoint(&self) -> bool {
        self.store.state().space.percent_used() >= u32::from(self.config.log_limit_percent)
    }

    pub fn generation_info(&self) -> GenerationInfo {
        let state = self.store.state();
        GenerationInfo {
            working: state.gens.working,
            stabilized: state.gens.stabilized,
            migrated: state.gens.migrated,
            durable_migrated: state.gens.durable_migrated,
        }
    }

    pub fn advance_clock(&mut self, ns: u64) {
        self.clock = self.clock.saturating_add(ns);
    }

    // ---- Object access ----

    pub fn get_object(
        &mut self,
        oid: Oid,
        base: BaseType,
        count: ObCount,
    ) -> PersistResult<Option<FrameId>> {
        Ok(self.cache.get_object(oid, base, count, true)?)
    }

    /// Fetch the object and record `holder` as prepared against it.
    pub fn prepare_key(
        &mut self,
        holder: HolderId,
        oid: Oid,
        base: BaseType,
        count: ObCount,
    ) -> PersistResult<Option<FrameId>> {
        let frame = self.get_object(oid, base, count)?;
        if let Some(frame) = frame {
            self.cache.prepare_key(holder, frame);
        }
        Ok(frame)
    }

    pub fn read_page(&mut self, oid: Oid, count: ObCount) -> PersistResult<Option<PageBuf>> {
        let frame = self.get_object(oid, BaseType::Page, count)?;
        Ok(frame.and_then(|f| self.cache.header(f).page().cloned()))
    }

    /// Overwrite a page. Returns `None` if `count` is stale.
    pub fn write_page(
        &mut self,
        oid: Oid,
        count: ObCount,
        page: &PageBuf,
    ) -> PersistResult<Option<FrameId>> {
        let Some(frame) = self.get_object(oid, BaseType::Page, count)? else {
            return Ok(None);
        };
        let frame = self.cache.prepare_for_write(frame)?;
        if let Some(target) = self.cache.header_mut(frame).page_mut() {
            *target = page.clone();
        }
        Ok(Some(frame))
    }

    pub fn read_node(&mut self, oid: Oid, count: ObCount) -> PersistResult<Option<NodeData>> {
        let frame = self.get_object(oid, BaseType::Node, count)?;
        Ok(frame.and_then(|f| self.cache.header(f).node().cloned()))
    }

    pub fn write_node(
        &mut self,
        oid: Oid,
        count: ObCount,
        data: NodeData,
    ) -> PersistResult<Option<FrameId>> {
        let Some(frame) = self.get_object(oid, BaseType::Node, count)? else {
            return Ok(None);
        };
        let frame = self.cache.prepare_for_write(frame)?;
        if let Some(target) = self.cache.header_mut(frame).node_mut() {
            *target = data;
        }
        Ok(Some(frame))
    }

    /// Free the object and reuse its OID. Returns the new allocation count,
    /// or `None` if `count` is stale.
    pub fn reallocate(
        &mut self,
        oid: Oid,
        base: BaseType,
        count: ObCount,
    ) -> PersistResult<Option<ObCount>> {
        let Some(frame) = self.get_object(oid, base, count)? else {
            return Ok(None);
        };
        let frame = self.cache.rescind(frame)?;
        let new_count = self.cache.header(frame).alloc_count;
        if !oid.is_persistent() && !oid.is_physical() {
            let mut state = self.store.state();
            state.gens.max_np_count = state.gens.max_np_count.max(new_count);
        }
        Ok(Some(new_count))
    }

    /// Remove the object from memory, cleaning it first. Returns false if
    /// it is pinned or cannot be cleaned now.
    pub fn evict(&mut self, oid: Oid, base: BaseType) -> PersistResult<bool> {
        match self.cache.lookup(base.fetched_type(), oid) {
            Some(frame) => Ok(self.cache.evict(frame)?),
            None => Ok(true),
        }
    }

    /// Withdraw a physical page; every capability to it goes stale.
    pub fn invalidate_phys_page(&mut self, oid: Oid) -> bool {
        self.physpages.invalidate(&mut self.cache, oid)
    }

    pub fn check_consistency(&self) -> PersistResult<()> {
        Ok(check_consistency(&self.cache)?)
    }

    // ---- Accessors ----

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ObjectCache {
        &mut self.cache
    }

    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    pub fn preload(&self) -> Option<&PreloadObjectSource> {
        self.preload.as_deref()
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn processes_mut(&mut self) -> &mut ProcessTable {
        &mut self.processes
    }

    pub fn reserves(&self) -> &ReserveTable {
        &self.reserves
    }

    pub fn reserves_mut(&mut self) -> &mut ReserveTable {
        &mut self.reserves
    }

    pub fn queues_mut(&mut self) -> &mut WaitQueues {
        &mut self.queues
    }
}

fn cache_ranges(cache: &ObjectCache) -> Vec<OidRange> {
    cache.ranges().iter().map(|r| r.range).collect()
}

/// The parts of `whole` not covered by `taken`.
fn subtract(whole: OidRange, mut taken: Vec<OidRange>) -> Vec<OidRange> {
    taken.sort_by_key(|r| r.start);
    let mut free = Vec::new();
    let mut start = whole.start;
    for range in taken.iter().filter_map(|r| r.intersect(&whole)) {
        if range.start > start {
            free.push(OidRange { start, end: range.start });
        }
        start = start.max(range.end);
    }
    if start < whole.end {
        free.push(OidRange { start, end: whole.end });
    }
    debug!(pieces = free.len(), "persistent ranges");
    free
}
