use capros_types::{Lid, Oid};

use crate::error::StoreResult;
use crate::home::HomeObject;
use crate::page::PageBuf;

/// The checkpoint log: an array of 4096-byte frames addressed by LID.
///
/// Implementations must satisfy these invariants:
/// - A frame that was never written reads back as zeros.
/// - Writes are not durable until [`LogDevice::sync`] returns; a crash may
///   drop any write issued since the last sync.
/// - Only the frame of a LID matters; the index bits are ignored.
pub trait LogDevice: Send + Sync {
    /// Number of frames on the device.
    fn frame_count(&self) -> u32;

    /// Whether the frame holding `lid` can be read now.
    fn is_mounted(&self, lid: Lid) -> bool;

    fn read_frame(&self, lid: Lid) -> StoreResult<PageBuf>;

    fn write_frame(&self, lid: Lid, page: &PageBuf) -> StoreResult<()>;

    /// Make every previous write durable.
    fn sync(&self) -> StoreResult<()>;
}

/// Permanent per-object storage filled by migration.
///
/// Writing an object replaces any earlier version for the same OID. Like the
/// log, writes become durable only at [`HomeStore::sync`].
pub trait HomeStore: Send + Sync {
    /// Returns `Ok(None)` if the object was never migrated.
    fn read(&self, oid: Oid) -> StoreResult<Option<HomeObject>>;

    fn write(&self, object: &HomeObject) -> StoreResult<()>;

    fn sync(&self) -> StoreResult<()>;

    /// Default implementation calls `write()` for each object.
    fn write_batch(&self, objects: &[HomeObject]) -> StoreResult<()> {
        objects.iter().try_for_each(|obj| self.write(obj))
    }
}
