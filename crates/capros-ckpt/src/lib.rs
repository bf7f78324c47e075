//! Checkpointing, migration and restart for the CapROS persistence core.
//!
//! Every modified persistent object is written to a circular log as part of
//! a numbered generation. A checkpoint closes the working generation and
//! commits it with an anchor written to one of two root slots; migration
//! later copies committed generations to the home store so their log space
//! can be reused. Restart picks the newest valid anchor and rebuilds the log
//! directory from the generations it lists.
//!
//! # Key Types
//!
//! - [`KernelCore`] -- cache, sources and engines over one log and one home store
//! - [`PersistentStore`] / [`PersistentObjectSource`] -- the persistent OID range
//! - [`LogDirectory`] -- where the logged version of each object lives
//! - [`LogSpace`] / [`Generations`] -- log frames and generation bookkeeping
//! - [`CoreConfig`] / [`BootParams`] -- sizing, policy and the boot command line
//!
//! # Engines
//!
//! - [`CheckpointEngine`] -- `NotActive -> Phase1 .. Phase5 -> NotActive`
//! - [`MigrationEngine`] -- oldest stabilized generation first
//! - [`RestartEngine`] -- `Begin -> QueuingRoot1 -> WaitingRoot1 -> Phase4 -> Done`
//!
//! Each engine advances one bounded step per call and reports a
//! [`StepOutcome`]; a blocked step names the [`QueueId`] to wait on.
//!
//! # Design Rules
//!
//! 1. The anchor write is the only commit point of a checkpoint.
//! 2. Log frames of a generation are reused only after an anchor records it migrated.
//! 3. Generations migrate strictly in order, and copying one again is harmless.
//! 4. Nothing is fetched from the persistent range before restart is done.

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod kernel;
pub mod log;
pub mod logdir;
pub mod migration;
pub mod persistent;
pub mod process;
pub mod queue;
pub mod restart;

pub use checkpoint::{CheckpointEngine, CheckpointPhase};
pub use config::{BootParams, CoreConfig};
pub use context::StepContext;
pub use error::{PersistError, PersistResult};
pub use kernel::{GenerationInfo, KernelCore, MigratorOp};
pub use log::{calc_log_reservation, GenerationRecord, Generations, LogSpace};
pub use logdir::{DirEntry, LogDirectory, ObjectDescriptor};
pub use migration::MigrationEngine;
pub use persistent::{PersistentObjectSource, PersistentStore, StoreState, StoredObject};
pub use process::{
    ProcessEntry, ProcessTable, Reserve, ReserveTable, HAZARD_SLEEPING, HAZARD_WAKE_RESTART,
};
pub use queue::{ActivityId, QueueId, StepOutcome, WaitQueues};
pub use restart::{RestartEngine, RestartPhase};
