//! Object cache for the CapROS persistence core.
//!
//! Every page and node a capability can reach is brought into memory here.
//! The cache owns a fixed arena of frame headers, finds resident objects
//! through the [`ObjectHash`], and asks the [`ObjectSource`] owning an OID
//! range to materialize anything that is not resident.
//!
//! # Key Types
//!
//! - [`ObjectCache`] -- frames, hash, key ring and source ranges
//! - [`ObjectHeader`] / [`FrameId`] -- per-frame state and its stable index
//! - [`ObjectHash`] -- OID to frame, chained through the headers
//! - [`KeyRing`] -- prepared capabilities, indexed by frame and by holder
//! - [`PhysMem`] / [`PmemInfo`] -- physical memory map
//!
//! # Object Sources
//!
//! - [`PreloadObjectSource`] -- objects from the boot image
//! - [`PhysPageSource`] -- physical frames and device memory as pages
//!
//! # Design Rules
//!
//! 1. An object is reachable by capability only while it is current.
//! 2. A capability with a stale allocation count never reaches the new occupant.
//! 3. A frame is stolen only when clean, unpinned and without prepared keys.
//! 4. A frozen object is copied before it is modified.

pub mod cache;
pub mod check;
pub mod checksum;
pub mod config;
pub mod error;
pub mod hash;
pub mod header;
pub mod keyring;
pub mod physmem;
pub mod physpage;
pub mod preload;
pub mod traits;

pub use cache::{ObjectCache, ObjectRange};
pub use check::check_consistency;
pub use checksum::page_checksum;
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use hash::ObjectHash;
pub use header::{FrameId, ObjectBody, ObjectHeader};
pub use keyring::{HolderId, KeyRing};
pub use physmem::{phys_frame, phys_oid, PhysMem, PmemInfo, PmemKind};
pub use physpage::PhysPageSource;
pub use preload::{PreloadImage, PreloadObjectSource};
pub use traits::ObjectSource;
