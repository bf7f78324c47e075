use capros_types::{BaseType, ObCount, Oid, OidRange};

use crate::cache::ObjectCache;
use crate::error::CacheResult;
use crate::header::FrameId;

/// Owner of one OID range: brings its objects into the cache and cleans
/// them again.
///
/// Sources are shared (`Arc`) and receive the cache mutably on every call,
/// so a source may grab frames, install objects and evict others.
pub trait ObjectSource: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Materialize `oid` as an object of type `base`.
    ///
    /// Returns `Ok(None)` when the object cannot exist as requested: wrong
    /// type, or `use_count` is set and the allocation count differs from
    /// `count`.
    fn get_object(
        &self,
        cache: &mut ObjectCache,
        oid: Oid,
        base: BaseType,
        count: ObCount,
        use_count: bool,
    ) -> CacheResult<Option<FrameId>>;

    /// Clean a dirty object. Returns `Ok(false)` when it cannot be cleaned
    /// now; the frame then stays resident.
    fn write_back(&self, cache: &mut ObjectCache, frame: FrameId) -> CacheResult<bool>;

    /// The part of `query` this source actually backs, given that it was
    /// registered for `claimed`.
    ///
    /// Default implementation backs the whole claimed range.
    fn implemented_subrange(&self, claimed: OidRange, query: OidRange) -> Option<OidRange> {
        claimed.intersect(&query)
    }
}
