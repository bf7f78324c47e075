use std::io;

use capros_cache::CacheError;
use capros_store::StoreError;
use capros_types::{GenNum, TypeError};

use crate::queue::QueueId;

/// Errors from the checkpoint, migration and restart engines.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Neither checkpoint anchor is valid. Restart cannot proceed and the
    /// kernel must halt.
    #[error("no valid checkpoint anchor: {root0}; {root1}")]
    NoValidCheckpoint { root0: String, root1: String },

    /// No log frame is free.
    #[error("checkpoint log is full")]
    LogFull,

    #[error("log directory is full ({capacity} entries)")]
    DirectoryFull { capacity: usize },

    #[error("log directory already tracks {max} generations")]
    TooManyGenerations { max: usize },

    /// A generation was about to be migrated out of order.
    #[error("migration of generation {found} out of order, expected {expected}")]
    OutOfOrderMigration { expected: GenNum, found: GenNum },

    /// A driver loop stopped on a wait queue nothing will wake.
    #[error("stalled on {0:?}")]
    Stalled(QueueId),

    /// Restart has not finished.
    #[error("restart is not done")]
    RestartNotDone,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),
}

/// Result alias for persistence operations.
pub type PersistResult<T> = Result<T, PersistError>;

impl From<PersistError> for CacheError {
    fn from(e: PersistError) -> Self {
        match e {
            PersistError::Cache(e) => e,
            PersistError::Store(e) => CacheError::Store(e),
            PersistError::Type(e) => CacheError::Type(e),
            PersistError::RestartNotDone => CacheError::NotReady("persistent store"),
            other => CacheError::Source {
                source_name: "persistent store",
                reason: other.to_string(),
            },
        }
    }
}
