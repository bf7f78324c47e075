use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid OID literal: {0}")]
    InvalidOid(String),

    #[error("LID {0:#x} does not fit in 28 bits")]
    LidOutOfRange(u64),

    #[error("unknown object type byte {0}")]
    UnknownObType(u8),

    #[error("unknown base type nibble {0}")]
    UnknownBaseType(u8),

    #[error("unknown LID tag nibble {0}")]
    UnknownLidTag(u8),

    #[error("empty OID range [{start:#x}, {end:#x})")]
    EmptyRange { start: u64, end: u64 },
}
