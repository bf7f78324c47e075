use std::io;

use capros_types::{Lid, TypeError};

/// Errors from log and home-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error from the underlying device or file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A sealed frame failed its CRC32 check.
    #[error("CRC mismatch in {what} at LID {lid}: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        what: &'static str,
        lid: Lid,
        expected: u32,
        actual: u32,
    },

    /// A header carried a version this code does not understand.
    #[error("{what} has version {found}, expected {expected}")]
    BadVersion {
        what: &'static str,
        found: u32,
        expected: u32,
    },

    /// A header failed an internal consistency check.
    #[error("{what} is malformed: {reason}")]
    Malformed { what: &'static str, reason: String },

    /// The LID lies beyond the mounted log.
    #[error("LID {lid} is beyond the mounted log ({frames} frames)")]
    FrameOutOfRange { lid: Lid, frames: u32 },

    /// The device is not mounted yet.
    #[error("log device is not mounted")]
    NotMounted,

    /// More entries than fit in one frame.
    #[error("{what} holds {count} entries, at most {max} fit")]
    TooManyEntries {
        what: &'static str,
        count: usize,
        max: usize,
    },

    /// A packed identifier could not be decoded.
    #[error("layout error: {0}")]
    Layout(#[from] TypeError),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
