use capros_store::StoreError;
use capros_types::{Oid, OidRange, TypeError};

use crate::header::FrameId;

/// Errors from object cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A clean page no longer matches the checksum taken when it was cleaned.
    #[error("checksum mismatch for {oid}: expected {expected:#018x}, got {actual:#018x}")]
    ChecksumMismatch { oid: Oid, expected: u64, actual: u64 },

    /// The aging scan found nothing it could reclaim.
    #[error("all {kind} frames are stuck ({stuck} unreclaimable, {pinned} pinned)")]
    AllFramesStuck {
        kind: &'static str,
        stuck: usize,
        pinned: usize,
    },

    /// A new source range overlaps one already registered.
    #[error("range {new} overlaps registered range {existing}")]
    RangeOverlap { new: OidRange, existing: OidRange },

    /// No registered source owns this OID.
    #[error("no object source owns {0}")]
    NoSource(Oid),

    /// The frame index does not exist.
    #[error("no such frame {0:?}")]
    NoSuchFrame(FrameId),

    /// The frame cannot be reused right now.
    #[error("frame {frame:?} is busy: {reason}")]
    FrameBusy { frame: FrameId, reason: &'static str },

    /// The source cannot serve requests yet.
    #[error("{0} is not ready")]
    NotReady(&'static str),

    /// A source-specific failure.
    #[error("{source_name}: {reason}")]
    Source {
        source_name: &'static str,
        reason: String,
    },

    /// The consistency checker found violations.
    #[error("cache inconsistent: {}", .0.join("; "))]
    Inconsistent(Vec<String>),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
