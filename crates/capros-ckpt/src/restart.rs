use std::collections::VecDeque;

use capros_store::{
    decode_dir_page, CkptDirent, DiskCheckpointHdr, DiskGenerationHdr, PageBuf, ReserveDirent,
    StoreError, ThreadDirent,
};
use capros_types::{GenNum, Lid, CKPT_ROOT_0, CKPT_ROOT_1};
use tracing::{debug, info, warn};

use crate::context::StepContext;
use crate::error::{PersistError, PersistResult};
use crate::log::{GenerationRecord, Generations};
use crate::logdir::ObjectDescriptor;
use crate::queue::{QueueId, StepOutcome};

/// Where the restart engine is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartPhase {
    Begin,
    /// Reading both anchor frames.
    QueuingRoot1,
    /// Choosing the newer valid anchor.
    WaitingRoot1,
    /// Reloading the log directory and the process and reserve tables.
    Phase4,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReloadStep {
    Generations,
    Threads,
    Reserves,
    AdjustNpCounts,
    Finish,
}

/// Rebuilds in-memory state from the newest committed checkpoint.
#[derive(Debug)]
pub struct RestartEngine {
    phase: RestartPhase,
    roots: Vec<(Lid, PageBuf)>,
    anchor: Option<DiskCheckpointHdr>,
    gen_hdrs: VecDeque<Lid>,
    last_generation: GenNum,
    reload: ReloadStep,
}

impl Default for RestartEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Order anchors by sequence number, then by migrated generation so that a
/// retirement anchor beats the checkpoint anchor it extends.
fn newer(a: &DiskCheckpointHdr, b: &DiskCheckpointHdr) -> bool {
    (a.sequence_number, a.migrated_generation) > (b.sequence_number, b.migrated_generation)
}

impl RestartEngine {
    pub fn new() -> Self {
        Self {
            phase: RestartPhase::Begin,
            roots: Vec::new(),
            anchor: None,
            gen_hdrs: VecDeque::new(),
            last_generation: 0,
            reload: ReloadStep::Generations,
        }
    }

    pub fn phase(&self) -> RestartPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == RestartPhase::Done
    }

    /// The anchor restart resumed from, once chosen.
    pub fn anchor(&self) -> Option<&DiskCheckpointHdr> {
        self.anchor.as_ref()
    }

    /// Run one bounded unit of restart work.
    pub fn step(&mut self, ctx: &mut StepContext<'_>) -> PersistResult<StepOutcome> {
        match self.phase {
            RestartPhase::Begin => self.begin(ctx),
            RestartPhase::QueuingRoot1 => self.read_roots(ctx),
            RestartPhase::WaitingRoot1 => self.choose_anchor(ctx),
            RestartPhase::Phase4 => self.reload(ctx),
            RestartPhase::Done => Ok(StepOutcome::Done),
        }
    }

    fn begin(&mut self, ctx: &mut StepContext<'_>) -> PersistResult<StepOutcome> {
        if ctx.config.big_bang {
            let mut state = ctx.store.state();
            state.directory.clear();
            state.gens = Generations::big_bang();
            let start = state.gens.working_first_lid;
            state.space.set_cursor(start)?;
            state.space.set_tail(start)?;
            state.restart_done = true;
            drop(state);
            ctx.processes.clear();
            ctx.reserves.clear();
            self.phase = RestartPhase::Done;
            ctx.queues.wake_all(QueueId::RestartQueue);
            info!("big bang: starting from an empty log");
            return Ok(StepOutcome::Progress);
        }
        let log = ctx.store.log();
        if !(log.is_mounted(CKPT_ROOT_0) && log.is_mounted(CKPT_ROOT_1)) {
            debug!("waiting for checkpoint anchors to be mounted");
            return Ok(StepOutcome::Blocked(QueueId::WaitForMount));
        }
        self.phase = RestartPhase::QueuingRoot1;
        Ok(StepOutcome::Progress)
    }

    fn read_roots(&mut self, ctx: &mut StepContext<'_>) -> PersistResult<StepOutcome> {
        let log = ctx.store.log();
        self.roots = vec![
            (CKPT_ROOT_0, log.read_frame(CKPT_ROOT_0)?),
            (CKPT_ROOT_1, log.read_frame(CKPT_ROOT_1)?),
        ];
        self.phase = RestartPhase::WaitingRoot1;
        Ok(StepOutcome::Progress)
    }

    fn choose_anchor(&mut self, ctx: &mut StepContext<'_>) -> PersistResult<StepOutcome> {
        let mut best: Option<(Lid, DiskCheckpointHdr)> = None;
        let mut reasons = Vec::new();
        for (lid, page) in self.roots.drain(..) {
            match DiskCheckpointHdr::decode(&page, lid) {
                Ok(hdr) => {
                    debug!(%lid, sequence = hdr.sequence_number, migrated = hdr.migrated_generation, "valid anchor");
                    if best.as_ref().map_or(true, |(_, b)| newer(&hdr, b)) {
                        best = Some((lid, hdr));
                    }
                    reasons.push(format!("{lid}: valid"));
                }
                Err(e) => {
                    warn!(%lid, error = %e, "anchor rejected");
                    reasons.push(format!("{lid}: {e}"));
                }
            }
        }
        let Some((root, anchor)) = best else {
            let root1 = reasons.pop().unwrap_or_default();
            let root0 = reasons.pop().unwrap_or_default();
            return Err(PersistError::NoValidCheckpoint { root0, root1 });
        };

        let mut state = ctx.store.state();
        if !state.space.contains(anchor.max_log_lid) {
            return Err(PersistError::Config(format!(
                "anchor expects the log to reach {}, device is smaller",
                anchor.max_log_lid
            )));
        }
        state.space.set_cursor(anchor.log_head)?;
        state.directory.clear();
        state.directory.generation_retired(anchor.migrated_generation);
        state.gens = Generations {
            working: anchor.sequence_number + 1,
            working_first_lid: anchor.log_head,
            stabilized: anchor.sequence_number,
            migrated: anchor.migrated_generation,
            durable_migrated: anchor.migrated_generation,
            root,
            thread_dir_pages: anchor.thread_dir_pages.clone(),
            reserve_dir_pages: anchor.reserve_dir_pages.clone(),
            time_of_demarc: anchor.time_of_demarc,
            max_np_count: anchor.max_np_count,
            ..Generations::big_bang()
        };
        drop(state);

        info!(
            %root,
            sequence = anchor.sequence_number,
            migrated = anchor.migrated_generation,
            generations = anchor.generation_hdrs.len(),
            "restarting from checkpoint"
        );
        self.gen_hdrs = anchor.generation_hdrs.iter().copied().collect();
        self.last_generation = 0;
        self.reload = ReloadStep::Generations;
        self.anchor = Some(anchor);
        ctx.processes.clear();
        ctx.reserves.clear();
        self.phase = RestartPhase::Phase4;
        Ok(StepOutcome::Progress)
    }

    fn reload(&mut self, ctx: &mut StepContext<'_>) -> PersistResult<StepOutcome> {
        let Some(anchor) = self.anchor.as_ref() else {
            self.phase = RestartPhase::Begin;
            return Ok(StepOutcome::Progress);
        };
        let log = ctx.store.log();
        match self.reload {
            ReloadStep::Generations => {
                let Some(lid) = self.gen_hdrs.pop_front() else {
                    self.reload = ReloadStep::Threads;
                    return Ok(StepOutcome::Progress);
                };
                let hdr = DiskGenerationHdr::decode(&log.read_frame(lid)?, lid)?;
                if hdr.generation <= self.last_generation {
                    return Err(StoreError::Malformed {
                        what: "checkpoint anchor",
                        reason: format!(
                            "generation {} listed after {}",
                            hdr.generation, self.last_generation
                        ),
                    }
                    .into());
                }
                self.last_generation = hdr.generation;

                let mut state = ctx.store.state();
                if hdr.generation > anchor.migrated_generation {
                    for &page_lid in &hdr.dir_pages {
                        let dirents: Vec<CkptDirent> =
                            decode_dir_page(&log.read_frame(page_lid)?, page_lid)?;
                        for d in &dirents {
                            state
                                .directory
                                .record_location(ObjectDescriptor::from_dirent(d), hdr.generation)?;
                        }
                    }
                }
                state.gens.records.insert(
                    hdr.generation,
                    GenerationRecord {
                        first_lid: hdr.first_lid,
                        header_lid: lid,
                        n_dir_pages: hdr.dir_pages.len() as u32,
                    },
                );
                debug!(generation = hdr.generation, objects = hdr.n_descriptors, "generation reloaded");
            }
            ReloadStep::Threads => {
                for &lid in &anchor.thread_dir_pages {
                    let dirents: Vec<ThreadDirent> = decode_dir_page(&log.read_frame(lid)?, lid)?;
                    dirents.iter().for_each(|d| ctx.processes.restore(d));
                }
                debug!(processes = ctx.processes.len(), "process table reloaded");
                self.reload = ReloadStep::Reserves;
            }
            ReloadStep::Reserves => {
                for &lid in &anchor.reserve_dir_pages {
                    let dirents: Vec<ReserveDirent> = decode_dir_page(&log.read_frame(lid)?, lid)?;
                    dirents.iter().for_each(|d| ctx.reserves.restore(d));
                }
                self.reload = ReloadStep::AdjustNpCounts;
            }
            ReloadStep::AdjustNpCounts => {
                // Capabilities to non-persistent objects saved by the
                // checkpoint must not reach this boot's objects.
                let np_count = anchor.max_np_count.wrapping_add(1);
                ctx.store.state().gens.max_np_count = np_count;
                if let Some(preload) = ctx.preload {
                    preload.set_alloc_count(np_count);
                }
                debug!(np_count, "non-persistent allocation count raised");
                self.reload = ReloadStep::Finish;
            }
            ReloadStep::Finish => {
                let mut state = ctx.store.state();
                state.reclaim()?;
                state.restart_done = true;
                let (entries, tail) = (state.directory.len(), state.space.tail());
                drop(state);
                self.phase = RestartPhase::Done;
                ctx.queues.wake_all(QueueId::RestartQueue);
                info!(entries, %tail, "restart done");
            }
        }
        Ok(StepOutcome::Progress)
    }
}
