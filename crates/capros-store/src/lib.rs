//! On-disk layouts and storage devices for the CapROS checkpoint log.
//!
//! The log is an array of 4096-byte frames addressed by LID. Frames 1 and 2
//! hold the two alternating checkpoint anchors; the main log starts at
//! frame 3 and wraps. Objects that migration has moved out of the log live
//! in a separate home store, one record per OID.
//!
//! # Frame Types
//!
//! - [`DiskCheckpointHdr`] -- the anchor, the durability commit point
//! - [`DiskGenerationHdr`] -- closes a generation, lists its directory pages
//! - [`CkptDirent`] / [`ThreadDirent`] / [`ReserveDirent`] -- directory entries
//! - [`NodePot`] -- up to seven nodes per frame
//! - [`PageBuf`] -- raw page contents
//!
//! # Storage Backends
//!
//! - [`InMemoryLogDevice`] / [`InMemoryHomeStore`] -- crash-simulating stores for tests
//! - [`FileLogDevice`] / [`FileHomeStore`] -- file-backed stores
//!
//! # Design Rules
//!
//! 1. All integers are little-endian.
//! 2. Every header, directory and pot frame carries a CRC32 trailer.
//! 3. Nothing is durable until `sync` returns.
//! 4. All I/O errors are propagated, never silently ignored.

pub mod error;
pub mod file;
pub mod home;
pub mod layout;
pub mod memory;
pub mod node;
pub mod page;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use file::{FileHomeStore, FileLogDevice, DEFAULT_COMPACT_PERCENT};
pub use home::{HomeBody, HomeObject};
pub use layout::{
    decode_dir_page, encode_dir_page, seal, verify_seal, CkptDirent, DirEntryCodec,
    DiskCheckpointHdr, DiskGenerationHdr, ReserveDirent, ThreadDirent, MAX_ANCHOR_LIDS,
    MAX_GENERATION_DIR_PAGES, SEAL_OFFSET,
};
pub use memory::{InMemoryHomeStore, InMemoryLogDevice};
pub use node::{DiskNode, KeySlot, KeyType, NodeData, NodePot, DISK_NODES_PER_PAGE};
pub use page::PageBuf;
pub use traits::{HomeStore, LogDevice};
