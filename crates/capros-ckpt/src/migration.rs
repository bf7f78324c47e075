use capros_store::HomeObject;
use capros_types::GenNum;
use tracing::{debug, info};

use crate::checkpoint::CheckpointPhase;
use crate::context::StepContext;
use crate::error::{PersistError, PersistResult};
use crate::logdir::ObjectDescriptor;
use crate::persistent::{PersistentStore, StoreState};
use crate::queue::{QueueId, StepOutcome};

/// Copies stabilized generations from the log to the home store, oldest
/// first, so their log space can be reused.
///
/// Copying is idempotent: a crash mid-generation leaves the anchor's
/// migrated generation unchanged and the whole generation is copied again
/// after restart.
#[derive(Debug, Default)]
pub struct MigrationEngine {
    generation: Option<GenNum>,
    pending: Vec<ObjectDescriptor>,
    cursor: usize,
    objects_migrated: u64,
}

impl MigrationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation being copied, if any.
    pub fn generation(&self) -> Option<GenNum> {
        self.generation
    }

    pub fn objects_migrated(&self) -> u64 {
        self.objects_migrated
    }

    /// Run one bounded unit of migration work.
    ///
    /// Returns `Idle` when every stabilized generation is home and recorded
    /// durably.
    pub fn step(
        &mut self,
        ctx: &mut StepContext<'_>,
        ckpt_phase: CheckpointPhase,
    ) -> PersistResult<StepOutcome> {
        if !ctx.store.is_restart_done() {
            return Ok(StepOutcome::Blocked(QueueId::RestartQueue));
        }
        let retire_allowed = matches!(
            ckpt_phase,
            CheckpointPhase::NotActive | CheckpointPhase::Phase1
        );

        let Some(generation) = self.generation else {
            let mut state = ctx.store.state();
            let next = state.gens.migrated + 1;
            if next <= state.gens.stabilized {
                self.pending = state.directory.migration_snapshot(next);
                self.cursor = 0;
                self.generation = Some(next);
                debug!(generation = next, objects = self.pending.len(), "migrating generation");
                return Ok(StepOutcome::Progress);
            }
            if retire_allowed && state.gens.durable_migrated < state.gens.migrated {
                retire(ctx.store, &mut state)?;
                drop(state);
                ctx.queues.wake_all(QueueId::WaitForLogSpace);
                return Ok(StepOutcome::Progress);
            }
            return Ok(StepOutcome::Idle);
        };

        let end = (self.cursor + ctx.config.migration_batch).min(self.pending.len());
        let objects = {
            let state = ctx.store.state();
            self.pending[self.cursor..end]
                .iter()
                .map(|od| Ok(state.read_logged(ctx.store.log(), od)?.into_home(od.oid)))
                .collect::<PersistResult<Vec<HomeObject>>>()?
        };
        ctx.store.home().write_batch(&objects)?;
        self.objects_migrated += objects.len() as u64;
        self.cursor = end;
        if self.cursor < self.pending.len() {
            return Ok(StepOutcome::Progress);
        }

        ctx.store.home().sync()?;
        let mut state = ctx.store.state();
        if state.gens.migrated + 1 != generation {
            return Err(PersistError::OutOfOrderMigration {
                expected: state.gens.migrated + 1,
                found: generation,
            });
        }
        state.gens.migrated = generation;
        state.directory.clear_generation(generation);
        info!(generation, objects = self.pending.len(), "generation migrated");
        self.generation = None;
        self.pending.clear();
        self.cursor = 0;

        if retire_allowed {
            retire(ctx.store, &mut state)?;
            drop(state);
            ctx.queues.wake_all(QueueId::WaitForLogSpace);
        }
        Ok(StepOutcome::Progress)
    }
}

/// Record the migrated generation in a fresh anchor and release its log
/// space. The anchor keeps the stabilized checkpoint's sequence number;
/// restart prefers it over the older one by its migrated generation.
fn retire(store: &PersistentStore, state: &mut StoreState) -> PersistResult<()> {
    let gens = &state.gens;
    let (sequence, migrated) = (gens.stabilized, gens.migrated);
    let anchor = gens.anchor(
        sequence,
        migrated,
        gens.working_first_lid,
        gens.tail_for(sequence, migrated),
        state.space.max_lid(),
        &gens.thread_dir_pages,
        &gens.reserve_dir_pages,
        gens.time_of_demarc,
    );
    store.write_anchor(state, &anchor)?;
    state.gens.durable_migrated = migrated;
    state.reclaim()?;
    debug!(
        migrated,
        tail = %state.space.tail(),
        available = state.space.available(),
        "log space reclaimed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use capros_store::{
        DiskCheckpointHdr, HomeStore, InMemoryHomeStore, InMemoryLogDevice, LogDevice, PageBuf,
    };
    use capros_types::{Oid, CKPT_ROOT_1};

    use super::*;
    use crate::config::CoreConfig;
    use crate::kernel::KernelCore;

    fn kernel_with(
        log: Arc<InMemoryLogDevice>,
        home: Arc<InMemoryHomeStore>,
    ) -> KernelCore {
        let config = CoreConfig::small(16, 16).with_big_bang(true);
        let mut kernel = KernelCore::new(config, log, home, None).unwrap();
        kernel.run_restart().unwrap();
        kernel
    }

    #[test]
    fn idle_until_a_generation_is_stabilized() {
        let log = Arc::new(InMemoryLogDevice::new(128));
        let home = Arc::new(InMemoryHomeStore::new());
        let mut kernel = kernel_with(log, home);
        assert_eq!(kernel.migration_step().unwrap(), StepOutcome::Idle);
    }

    #[test]
    fn migrated_generation_moves_home_and_frees_log() {
        let log = Arc::new(InMemoryLogDevice::new(128));
        let home = Arc::new(InMemoryHomeStore::new());
        let mut kernel = kernel_with(log.clone(), home.clone());
        for i in 0..6u64 {
            kernel
                .write_page(Oid(0x1000 + i * 256), 0, &PageBuf::filled(i as u8 + 1))
                .unwrap();
        }
        kernel.run_checkpoint().unwrap();
        let used_before = kernel.store().state().space.used();

        kernel.run_migration().unwrap();
        assert_eq!(home.durable_len(), 6);
        assert_eq!(
            home.read(Oid(0x1000 + 3 * 256)).unwrap().unwrap().page_buf(),
            Some(PageBuf::filled(4))
        );
        let info = kernel.generation_info();
        assert_eq!((info.stabilized, info.migrated), (1, 1));
        assert!(kernel.store().state().directory.is_empty());

        // Retirement anchor: same sequence, alternate slot, newer migrated.
        let anchor = DiskCheckpointHdr::decode(&log.read_frame(CKPT_ROOT_1).unwrap(), CKPT_ROOT_1)
            .unwrap();
        assert_eq!(anchor.sequence_number, 1);
        assert_eq!(anchor.migrated_generation, 1);
        assert!(anchor.has_migrated);
        // Generation 1 is the latest checkpoint, so its frames stay.
        assert_eq!(kernel.store().state().space.used(), used_before);

        // Objects now come from home.
        kernel.evict(Oid(0x1000), capros_types::BaseType::Page).unwrap();
        assert_eq!(
            kernel.read_page(Oid(0x1000), 0).unwrap(),
            Some(PageBuf::filled(1))
        );
    }

    #[test]
    fn second_checkpoint_releases_first_generation() {
        let log = Arc::new(InMemoryLogDevice::new(128));
        let home = Arc::new(InMemoryHomeStore::new());
        let mut kernel = kernel_with(log, home);
        kernel.write_page(Oid(0x1000), 0, &PageBuf::filled(1)).unwrap();
        kernel.run_checkpoint().unwrap();
        let first_tail = kernel.store().state().space.tail();
        kernel.run_migration().unwrap();

        kernel.write_page(Oid(0x2000), 0, &PageBuf::filled(2)).unwrap();
        kernel.run_checkpoint().unwrap();
        let state = kernel.store().state();
        assert_ne!(state.space.tail(), first_tail);
        assert_eq!(state.gens.records.keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn crash_mid_migration_is_repeated_after_restart() {
        let log = Arc::new(InMemoryLogDevice::new(128));
        let home = Arc::new(InMemoryHomeStore::new());
        let mut kernel = kernel_with(log.clone(), home.clone());
        for i in 0..6u64 {
            kernel
                .write_page(Oid(0x1000 + i * 256), 0, &PageBuf::filled(0x40 + i as u8))
                .unwrap();
        }
        kernel.run_checkpoint().unwrap();
        // One batch of four, then crash.
        assert_eq!(kernel.migration_step().unwrap(), StepOutcome::Progress);
        assert_eq!(kernel.migration_step().unwrap(), StepOutcome::Progress);
        drop(kernel);
        log.simulate_crash();
        home.simulate_crash();
        assert_eq!(home.durable_len(), 0);

        let config = CoreConfig::small(16, 16);
        let mut kernel = KernelCore::new(config, log, home.clone(), None).unwrap();
        kernel.run_restart().unwrap();
        assert_eq!(kernel.generation_info().migrated, 0);
        kernel.run_migration().unwrap();
        let uninterrupted: Vec<HomeObject> = (0..6u64)
            .map(|i| {
                HomeObject::page(Oid(0x1000 + i * 256), 0, &PageBuf::filled(0x40 + i as u8))
            })
            .collect();
        assert_eq!(home.durable_objects(), uninterrupted);

        // Migrating again changes nothing.
        kernel.run_migration().unwrap();
        assert_eq!(home.durable_objects(), uninterrupted);
    }
}
