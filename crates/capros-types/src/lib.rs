//! Foundation types for the CapROS persistence core.
//!
//! Every other crate in the workspace depends on `capros-types`. The types
//! here name objects (OIDs), their locations in the checkpoint log (LIDs),
//! and the per-object state the object cache tracks.
//!
//! # Key Types
//!
//! - [`Oid`] -- persistent 64-bit object identifier, partitioned into ranges
//! - [`OidRange`] -- half-open interval of OIDs owned by one object source
//! - [`Lid`] -- 28-bit location of an object version in the checkpoint log
//! - [`PackedLid`] -- on-disk `lid_t` with a 4-bit tag
//! - [`ObType`] / [`BaseType`] -- frame type tags and their canonical forms
//! - [`ObjectFlags`] -- dirty / current / frozen state bits
//! - [`Age`] -- eviction age hint

pub mod error;
pub mod lid;
pub mod object;
pub mod oid;

pub use error::TypeError;
pub use lid::{
    GenNum, Lid, LidTag, PackedLid, CKPT_ROOT_0, CKPT_ROOT_1, MAIN_LOG_START, MAX_LID_VALUE,
    UNDEF_LID, ZERO_LID,
};
pub use object::{Age, BaseType, ObType, ObjectFlags};
pub use oid::{
    ObCount, Oid, OidRange, FIRST_PERSISTENT_OID, NODE_SIZE, OBJECTS_PER_FRAME,
    OID_RESERVED_PHYSRANGE, PAGE_SIZE,
};
