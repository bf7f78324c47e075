use capros_cache::{FrameId, ObjectHeader};
use capros_store::{
    encode_dir_page, CkptDirent, DirEntryCodec, DiskCheckpointHdr, DiskGenerationHdr,
    ReserveDirent, ThreadDirent,
};
use capros_types::{GenNum, Lid, ObjectFlags};
use tracing::{debug, info, warn};

use crate::context::StepContext;
use crate::error::{PersistError, PersistResult};
use crate::log::{calc_log_reservation, GenerationRecord};
use crate::queue::{QueueId, StepOutcome};

/// Where the checkpoint engine is.
///
/// `Phase1` declares the demarcation and freezes the dirty set, `Phase2`
/// writes frozen objects, `Phase3` writes the generation's directory,
/// `Phase4` writes the anchor (the commit point) and `Phase5` cleans up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointPhase {
    NotActive,
    Phase1,
    Phase2,
    Phase3,
    Phase4,
    Phase5,
}

/// Takes snapshots of the object cache into the log, one bounded step at
/// a time.
#[derive(Debug)]
pub struct CheckpointEngine {
    phase: CheckpointPhase,
    generation: GenNum,
    demarc_time: u64,
    scan: usize,
    threads: Vec<ThreadDirent>,
    reserves: Vec<ReserveDirent>,
    dirents: Vec<CkptDirent>,
    dir_pages: Vec<Lid>,
    thread_pages: Vec<Lid>,
    reserve_pages: Vec<Lid>,
    anchor: Option<DiskCheckpointHdr>,
    completed: u64,
}

impl Default for CheckpointEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn should_freeze(hdr: &ObjectHeader) -> bool {
    hdr.is_current()
        && hdr.is_dirty()
        && hdr.flags.contains(ObjectFlags::CLEANABLE)
        && hdr.oid.is_persistent()
        && hdr.base_type().is_some()
}

impl CheckpointEngine {
    pub fn new() -> Self {
        Self {
            phase: CheckpointPhase::NotActive,
            generation: 0,
            demarc_time: 0,
            scan: 0,
            threads: Vec::new(),
            reserves: Vec::new(),
            dirents: Vec::new(),
            dir_pages: Vec::new(),
            thread_pages: Vec::new(),
            reserve_pages: Vec::new(),
            anchor: None,
            completed: 0,
        }
    }

    pub fn phase(&self) -> CheckpointPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase != CheckpointPhase::NotActive
    }

    /// Number of checkpoints committed since boot.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Generation being checkpointed, while one is in flight.
    pub fn generation(&self) -> Option<GenNum> {
        self.is_active().then_some(self.generation)
    }

    /// Start a checkpoint. Returns `false` if one is already running.
    pub fn declare_demarcation_event(&mut self, ctx: &mut StepContext<'_>) -> bool {
        if self.is_active() {
            return false;
        }
        self.phase = CheckpointPhase::Phase1;
        ctx.queues.wake_all(QueueId::WaitForCkptNeeded);
        debug!("demarcation event declared");
        true
    }

    /// Run one bounded unit of checkpoint work.
    pub fn step(&mut self, ctx: &mut StepContext<'_>) -> PersistResult<StepOutcome> {
        match self.phase {
            CheckpointPhase::NotActive => Ok(StepOutcome::Blocked(QueueId::WaitForCkptNeeded)),
            CheckpointPhase::Phase1 => self.demarcate(ctx),
            CheckpointPhase::Phase2 => self.write_objects(ctx),
            CheckpointPhase::Phase3 => self.write_directory(ctx),
            CheckpointPhase::Phase4 => self.commit(ctx),
            CheckpointPhase::Phase5 => self.finish(ctx),
        }
    }

    fn demarcate(&mut self, ctx: &mut StepContext<'_>) -> PersistResult<StepOutcome> {
        if !ctx.store.is_restart_done() {
            return Ok(StepOutcome::Blocked(QueueId::RestartQueue));
        }
        let frozen: Vec<(FrameId, bool)> = ctx
            .cache
            .frames()
            .filter(|(_, hdr)| should_freeze(hdr))
            .map(|(frame, hdr)| (frame, hdr.is_node_frame()))
            .collect();
        let nodes = frozen.iter().filter(|(_, node)| *node).count();
        let pages = frozen.len() - nodes;

        let state = ctx.store.state();
        let generation = state.gens.working;
        let needed = calc_log_reservation(
            pages,
            nodes,
            state.directory.num_working_entries(generation),
            ctx.processes.len(),
            ctx.reserves.len(),
        );
        let available = state.space.available();
        if available < needed || state.directory.num_available_entries() < frozen.len() {
            warn!(needed, available, objects = frozen.len(), "not enough log space for checkpoint");
            return Ok(StepOutcome::Blocked(QueueId::WaitForLogSpace));
        }
        if !frozen.is_empty() && !state.directory.has_room_for_generation(generation) {
            warn!(generation, "generation limit reached, waiting for migration");
            return Ok(StepOutcome::Blocked(QueueId::WaitForLogSpace));
        }
        drop(state);

        for (frame, _) in &frozen {
            ctx.cache.header_mut(*frame).flags.insert(ObjectFlags::CKPT);
        }
        self.generation = generation;
        self.demarc_time = ctx.now;
        self.scan = 0;
        self.threads = ctx.processes.snapshot();
        self.reserves = ctx.reserves.snapshot();
        ctx.cache.set_checkpoint_active(true);
        self.phase = CheckpointPhase::Phase2;
        info!(generation, pages, nodes, reserved = needed, "checkpoint started");
        Ok(StepOutcome::Progress)
    }

    fn write_objects(&mut self, ctx: &mut StepContext<'_>) -> PersistResult<StepOutcome> {
        let total = ctx.cache.frame_count();
        let mut written = 0;
        while self.scan < total && written < ctx.config.checkpoint_batch {
            let frame = FrameId(self.scan as u32);
            let hdr = ctx.cache.header(frame);
            if !hdr.is_frozen() {
                self.scan += 1;
                continue;
            }
            let working_copy = !hdr.is_current();
            let result = ctx
                .store
                .state()
                .write_object(ctx.store.log(), hdr, self.generation);
            match result {
                Ok(_) => {}
                Err(
                    e @ (PersistError::LogFull
                    | PersistError::DirectoryFull { .. }
                    | PersistError::TooManyGenerations { .. }),
                ) => {
                    warn!(generation = self.generation, error = %e, "checkpoint waiting for log space");
                    return Ok(StepOutcome::Blocked(QueueId::WaitForLogSpace));
                }
                Err(e) => return Err(e),
            }
            if working_copy {
                ctx.cache.release_frame(frame);
            } else {
                ctx.cache.mark_clean(frame);
            }
            self.scan += 1;
            written += 1;
        }
        if self.scan < total {
            return Ok(StepOutcome::Progress);
        }

        let log = ctx.store.log();
        let mut state = ctx.store.state();
        state.flush_pot(log)?;
        for chunk in self.threads.chunks(ThreadDirent::PER_PAGE) {
            let lid = state.append_page(log, &encode_dir_page(chunk)?)?;
            self.thread_pages.push(lid);
        }
        for chunk in self.reserves.chunks(ReserveDirent::PER_PAGE) {
            let lid = state.append_page(log, &encode_dir_page(chunk)?)?;
            self.reserve_pages.push(lid);
        }
        self.dirents = state
            .directory
            .generation_entries(self.generation)
            .iter()
            .map(|od| od.to_dirent())
            .collect();
        debug!(
            generation = self.generation,
            dirents = self.dirents.len(),
            threads = self.threads.len(),
            "checkpoint objects written"
        );
        self.phase = CheckpointPhase::Phase3;
        Ok(StepOutcome::Progress)
    }

    fn write_directory(&mut self, ctx: &mut StepContext<'_>) -> PersistResult<StepOutcome> {
        let log = ctx.store.log();
        let mut state = ctx.store.state();
        let mut chunks = self.dirents.chunks(CkptDirent::PER_PAGE).skip(self.dir_pages.len());
        for _ in 0..ctx.config.dir_page_batch {
            let Some(chunk) = chunks.next() else { break };
            let lid = state.append_page(log, &encode_dir_page(chunk)?)?;
            self.dir_pages.push(lid);
        }
        if self.dir_pages.len() < self.dirents.len().div_ceil(CkptDirent::PER_PAGE) {
            return Ok(StepOutcome::Progress);
        }

        let header_lid = state.space.next_log_loc()?;
        let first_lid = state.gens.working_first_lid;
        let hdr = DiskGenerationHdr {
            generation: self.generation,
            first_lid,
            last_lid: header_lid,
            time_of_demarc: self.demarc_time,
            n_descriptors: self.dirents.len() as u32,
            dir_pages: self.dir_pages.clone(),
        };
        log.write_frame(header_lid, &hdr.encode()?)?;
        state.gens.records.insert(
            self.generation,
            GenerationRecord {
                first_lid,
                header_lid,
                n_dir_pages: self.dir_pages.len() as u32,
            },
        );
        debug!(generation = self.generation, %header_lid, dir_pages = self.dir_pages.len(), "generation header written");
        self.phase = CheckpointPhase::Phase4;
        Ok(StepOutcome::Progress)
    }

    fn commit(&mut self, ctx: &mut StepContext<'_>) -> PersistResult<StepOutcome> {
        ctx.store.log().sync()?;
        let mut state = ctx.store.state();
        let migrated = state.gens.migrated;
        let anchor = state.gens.anchor(
            self.generation,
            migrated,
            state.space.cursor(),
            state.gens.tail_for(self.generation, migrated),
            state.space.max_lid(),
            &self.thread_pages,
            &self.reserve_pages,
            self.demarc_time,
        );
        ctx.store.write_anchor(&mut state, &anchor)?;
        self.anchor = Some(anchor);
        self.phase = CheckpointPhase::Phase5;
        Ok(StepOutcome::Progress)
    }

    fn finish(&mut self, ctx: &mut StepContext<'_>) -> PersistResult<StepOutcome> {
        let mut state = ctx.store.state();
        if let Some(anchor) = self.anchor.take() {
            let gens = &mut state.gens;
            gens.stabilized = self.generation;
            gens.durable_migrated = anchor.migrated_generation;
            gens.thread_dir_pages = std::mem::take(&mut self.thread_pages);
            gens.reserve_dir_pages = std::mem::take(&mut self.reserve_pages);
            gens.time_of_demarc = self.demarc_time;
            gens.working = self.generation + 1;
            gens.working_first_lid = anchor.log_head;
        }
        state.reclaim()?;
        let (used, working) = (state.space.percent_used(), state.gens.working);
        drop(state);

        ctx.cache.set_checkpoint_active(false);
        ctx.queues.wake_all(QueueId::WaitForCkptInactive);
        ctx.queues.wake_all(QueueId::WaitForLogSpace);
        self.threads.clear();
        self.reserves.clear();
        self.dirents.clear();
        self.dir_pages.clear();
        self.completed += 1;
        self.phase = CheckpointPhase::NotActive;
        info!(generation = self.generation, next = working, log_used_pct = used, "checkpoint complete");
        Ok(StepOutcome::Progress)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use capros_store::{
        decode_dir_page, DiskCheckpointHdr, DiskGenerationHdr, InMemoryHomeStore,
        InMemoryLogDevice, LogDevice, PageBuf,
    };
    use capros_types::{BaseType, Oid, CKPT_ROOT_0, MAIN_LOG_START};

    use super::*;
    use crate::config::CoreConfig;
    use crate::kernel::KernelCore;

    fn fresh(frames: u32) -> (KernelCore, Arc<InMemoryLogDevice>) {
        fresh_with(CoreConfig::small(16, 16), frames)
    }

    fn fresh_with(config: CoreConfig, frames: u32) -> (KernelCore, Arc<InMemoryLogDevice>) {
        let log = Arc::new(InMemoryLogDevice::new(frames));
        let home = Arc::new(InMemoryHomeStore::new());
        let mut kernel = KernelCore::new(config.with_big_bang(true), log.clone(), home, None).unwrap();
        kernel.run_restart().unwrap();
        (kernel, log)
    }

    /// Drive one checkpoint to completion, migrating whenever it waits for
    /// log space. Returns how many times it waited.
    fn checkpoint_counting_stalls(kernel: &mut KernelCore) -> usize {
        let mut stalls = 0;
        kernel.declare_demarcation_event();
        while kernel.checkpoint_phase() != CheckpointPhase::NotActive {
            match kernel.do_checkpoint_step().unwrap() {
                StepOutcome::Blocked(QueueId::WaitForLogSpace) => {
                    stalls += 1;
                    assert_ne!(kernel.migration_step().unwrap(), StepOutcome::Idle);
                }
                StepOutcome::Progress => {}
                other => panic!("unexpected checkpoint outcome {other:?}"),
            }
        }
        stalls
    }

    #[test]
    fn not_active_waits_for_demarcation() {
        let (mut kernel, _) = fresh(64);
        assert_eq!(kernel.checkpoint_phase(), CheckpointPhase::NotActive);
        assert_eq!(
            kernel.do_checkpoint_step().unwrap(),
            StepOutcome::Blocked(QueueId::WaitForCkptNeeded)
        );
        assert!(kernel.declare_demarcation_event());
        assert!(!kernel.declare_demarcation_event());
        assert_eq!(kernel.checkpoint_phase(), CheckpointPhase::Phase1);
    }

    #[test]
    fn phases_run_in_order_and_write_anchor_last() {
        let (mut kernel, log) = fresh(64);
        for i in 0..3u64 {
            kernel
                .write_page(Oid(0x1000 + i * 256), 0, &PageBuf::filled(i as u8 + 1))
                .unwrap();
        }
        kernel.declare_demarcation_event();
        let mut phases = vec![kernel.checkpoint_phase()];
        while kernel.checkpoint_phase() != CheckpointPhase::NotActive {
            assert_eq!(kernel.do_checkpoint_step().unwrap(), StepOutcome::Progress);
            if phases.last() != Some(&kernel.checkpoint_phase()) {
                phases.push(kernel.checkpoint_phase());
            }
            if kernel.checkpoint_phase() == CheckpointPhase::Phase4 {
                // Nothing is committed until the anchor is written.
                assert!(log.read_frame(CKPT_ROOT_0).unwrap().is_zero());
            }
        }
        assert_eq!(
            phases,
            vec![
                CheckpointPhase::Phase1,
                CheckpointPhase::Phase2,
                CheckpointPhase::Phase3,
                CheckpointPhase::Phase4,
                CheckpointPhase::Phase5,
                CheckpointPhase::NotActive,
            ]
        );

        let anchor = DiskCheckpointHdr::decode(&log.read_frame(CKPT_ROOT_0).unwrap(), CKPT_ROOT_0)
            .unwrap();
        assert_eq!(anchor.sequence_number, 1);
        assert_eq!(anchor.generation_hdrs.len(), 1);
        let gen_lid = anchor.generation_hdrs[0];
        let gen = DiskGenerationHdr::decode(&log.read_frame(gen_lid).unwrap(), gen_lid).unwrap();
        assert_eq!(gen.generation, 1);
        assert_eq!(gen.first_lid, MAIN_LOG_START);
        assert_eq!(gen.n_descriptors, 3);
        let dirents: Vec<CkptDirent> =
            decode_dir_page(&log.read_frame(gen.dir_pages[0]).unwrap(), gen.dir_pages[0]).unwrap();
        assert!(dirents.iter().all(|d| d.base_type == BaseType::Page));
        assert_eq!(kernel.checkpoints_completed(), 1);
        assert_eq!(kernel.generation_info().working, 2);
    }

    #[test]
    fn frozen_object_modified_mid_checkpoint_keeps_snapshot() {
        let (mut kernel, _) = fresh(64);
        let oid = Oid(0x1000);
        kernel.write_page(oid, 0, &PageBuf::filled(0x11)).unwrap();
        kernel.declare_demarcation_event();
        kernel.do_checkpoint_step().unwrap();
        assert_eq!(kernel.checkpoint_phase(), CheckpointPhase::Phase2);

        // Copy-on-write: the frozen copy is written, the new one stays dirty.
        kernel.write_page(oid, 0, &PageBuf::filled(0x22)).unwrap();
        kernel.run_checkpoint().unwrap();

        let frame = kernel.get_object(oid, BaseType::Page, 0).unwrap().unwrap();
        let hdr = kernel.cache().header(frame);
        assert!(hdr.is_dirty());
        assert_eq!(hdr.page(), Some(&PageBuf::filled(0x22)));
        let od = *kernel.store().state().directory.find_object(oid).unwrap();
        let stored = kernel.store().state().read_logged(kernel.store().log(), &od).unwrap();
        assert_eq!(
            stored,
            crate::persistent::StoredObject::Page {
                alloc_count: 0,
                page: PageBuf::filled(0x11)
            }
        );
        kernel.check_consistency().unwrap();
    }

    #[test]
    fn blocks_when_log_cannot_hold_checkpoint() {
        // Main log of 4 frames: 3 usable, not enough for 4 dirty pages.
        let (mut kernel, _) = fresh(MAIN_LOG_START.frame() + 4);
        for i in 0..4u64 {
            kernel
                .write_page(Oid(0x1000 + i * 256), 0, &PageBuf::filled(9))
                .unwrap();
        }
        kernel.declare_demarcation_event();
        assert_eq!(
            kernel.do_checkpoint_step().unwrap(),
            StepOutcome::Blocked(QueueId::WaitForLogSpace)
        );
        assert_eq!(kernel.checkpoint_phase(), CheckpointPhase::Phase1);
        assert!(!kernel.cache().checkpoint_active());
    }

    #[test]
    fn stalled_checkpoint_resumes_after_migration_frees_log() {
        // 21 main log frames hold about four checkpoints of two pages each.
        let (mut kernel, _) = fresh(MAIN_LOG_START.frame() + 21);
        let mut stalls = 0;
        for round in 0..8u8 {
            for i in 0..2u64 {
                kernel
                    .write_page(Oid(0x1000 + i * 256), 0, &PageBuf::filled(round + 1))
                    .unwrap();
            }
            stalls += checkpoint_counting_stalls(&mut kernel);
            assert_eq!(kernel.checkpoints_completed(), u64::from(round) + 1);
        }
        assert!(stalls > 0);
        let info = kernel.generation_info();
        assert_eq!(info.stabilized, 8);
        assert!(info.migrated >= 1);
        assert_eq!(
            kernel.read_page(Oid(0x1100), 0).unwrap(),
            Some(PageBuf::filled(8))
        );
        kernel.check_consistency().unwrap();
    }

    #[test]
    fn generation_limit_blocks_until_migration() {
        let mut config = CoreConfig::small(16, 16);
        config.max_generations = 2;
        let (mut kernel, _) = fresh_with(config, 128);
        for i in 0..2u64 {
            kernel
                .write_page(Oid(0x1000 + i * 256), 0, &PageBuf::filled(i as u8 + 1))
                .unwrap();
            kernel.declare_demarcation_event();
            while kernel.checkpoint_phase() != CheckpointPhase::NotActive {
                assert_eq!(kernel.do_checkpoint_step().unwrap(), StepOutcome::Progress);
            }
        }
        assert_eq!(kernel.store().state().directory.generations(), vec![1, 2]);

        kernel.write_page(Oid(0x1200), 0, &PageBuf::filled(3)).unwrap();
        kernel.declare_demarcation_event();
        assert_eq!(
            kernel.do_checkpoint_step().unwrap(),
            StepOutcome::Blocked(QueueId::WaitForLogSpace)
        );
        assert_eq!(kernel.checkpoint_phase(), CheckpointPhase::Phase1);
        assert!(!kernel.cache().checkpoint_active());

        assert!(checkpoint_counting_stalls(&mut kernel) > 0);
        let info = kernel.generation_info();
        assert_eq!((info.working, info.stabilized), (4, 3));
        assert!(info.migrated >= 1);
        kernel.check_consistency().unwrap();
    }
}
