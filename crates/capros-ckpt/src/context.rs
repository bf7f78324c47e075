use capros_cache::{ObjectCache, PreloadObjectSource};

use crate::config::CoreConfig;
use crate::persistent::PersistentStore;
use crate::process::{ProcessTable, ReserveTable};
use crate::queue::WaitQueues;

/// Everything one engine step may touch.
pub struct StepContext<'a> {
    pub config: &'a CoreConfig,
    pub cache: &'a mut ObjectCache,
    pub store: &'a PersistentStore,
    pub queues: &'a mut WaitQueues,
    pub processes: &'a mut ProcessTable,
    pub reserves: &'a mut ReserveTable,
    /// Source for the boot image, if one is loaded.
    pub preload: Option<&'a PreloadObjectSource>,
    /// Current time, in nanoseconds since boot.
    pub now: u64,
}
