use capros_types::{ObType, ObjectFlags};
use tracing::warn;

use crate::cache::ObjectCache;
use crate::error::{CacheError, CacheResult};
use crate::hash::bucket;

/// Walk the whole cache and report every broken invariant.
///
/// Checks that current objects are interned and found by lookup, that free
/// frames are neither current nor hashed, that clean pages still match
/// their checksums, that every prepared capability targets a current
/// object, and that frozen objects are where a checkpoint expects them.
pub fn check_consistency(cache: &ObjectCache) -> CacheResult<()> {
    let mut problems = Vec::new();
    let arena = cache.arena();

    for (frame, hdr) in cache.frames() {
        if cache.is_free_listed(frame) {
            if hdr.is_current() || hdr.is_interned() || !hdr.ob_type.is_free() {
                problems.push(format!("free frame {frame:?} is in use as {}", hdr.oid));
            }
            continue;
        }

        if hdr.is_current() {
            if hdr.base_type().is_none() {
                problems.push(format!("current frame {frame:?} has type {}", hdr.ob_type));
            } else if cache.hash().find(arena, hdr.ob_type.canonical(), hdr.oid) != Some(frame) {
                problems.push(format!("{} in {frame:?} is not found by lookup", hdr.oid));
            }
            if let Err(e) = cache.verify_checksum(frame) {
                problems.push(e.to_string());
            }
        } else if hdr.is_interned() {
            problems.push(format!("non-current frame {frame:?} is interned"));
        }

        let working_copy = matches!(hdr.ob_type, ObType::PtWorkingCopy | ObType::NtWorkingCopy);
        if hdr.is_frozen() && !hdr.is_dirty() {
            problems.push(format!("frozen {} is not dirty", hdr.oid));
        }
        if working_copy && !hdr.flags.contains(ObjectFlags::CKPT) {
            problems.push(format!("working copy of {} is not frozen", hdr.oid));
        }
        if (hdr.is_frozen() || working_copy) && !cache.checkpoint_active() {
            problems.push(format!("{} is frozen outside a checkpoint", hdr.oid));
        }
    }

    let hash = cache.hash();
    for b in 0..hash.bucket_count() {
        for frame in hash.chain(arena, b) {
            let hdr = cache.header(frame);
            if !hdr.is_current() {
                problems.push(format!("bucket {b} chains non-current frame {frame:?}"));
            }
            if bucket(hdr.oid, hash.bucket_count()) != b {
                problems.push(format!("{} chained in wrong bucket {b}", hdr.oid));
            }
        }
    }

    for frame in cache.keyring().targets() {
        if !cache.header(frame).is_current() {
            problems.push(format!("prepared key targets non-current frame {frame:?}"));
        }
    }

    if problems.is_empty() {
        return Ok(());
    }
    warn!(count = problems.len(), first = %problems[0], "cache consistency check failed");
    Err(CacheError::Inconsistent(problems))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::tests::MapSource;
    use crate::config::CacheConfig;
    use crate::keyring::HolderId;
    use crate::physmem::PhysMem;
    use capros_types::{BaseType, Oid, OidRange};

    fn cache() -> ObjectCache {
        let mut cache = ObjectCache::new(CacheConfig::small(2), PhysMem::ram_only(4));
        cache
            .add_range(
                OidRange::new(Oid(0x1000), Oid(0x10_0000)).unwrap(),
                Arc::new(MapSource::default()),
            )
            .unwrap();
        cache
    }

    #[test]
    fn fresh_and_busy_caches_are_consistent() {
        let mut cache = cache();
        check_consistency(&cache).unwrap();
        let frame = cache
            .get_object(Oid(0x1000), BaseType::Page, 0, false)
            .unwrap()
            .unwrap();
        cache.prepare_key(HolderId(1), frame);
        let frame = cache.prepare_for_write(frame).unwrap();
        cache.header_mut(frame).page_mut().unwrap().as_bytes_mut()[0] = 1;
        check_consistency(&cache).unwrap();
    }

    #[test]
    fn silent_page_corruption_is_reported() {
        let mut cache = cache();
        let frame = cache
            .get_object(Oid(0x1000), BaseType::Page, 0, false)
            .unwrap()
            .unwrap();
        cache.header_mut(frame).page_mut().unwrap().as_bytes_mut()[9] = 0xEE;
        match check_consistency(&cache) {
            Err(CacheError::Inconsistent(problems)) => {
                assert!(problems[0].contains("checksum"))
            }
            other => panic!("expected inconsistency, got {other:?}"),
        }
    }

    #[test]
    fn dangling_keys_and_stale_hash_entries_are_reported() {
        let mut cache = cache();
        let frame = cache
            .get_object(Oid(0x1000), BaseType::Page, 0, false)
            .unwrap()
            .unwrap();
        cache.prepare_key(HolderId(1), frame);
        cache.header_mut(frame).flags.remove(ObjectFlags::CURRENT);
        let Err(CacheError::Inconsistent(problems)) = check_consistency(&cache) else {
            panic!("expected inconsistency");
        };
        assert!(problems.iter().any(|p| p.contains("prepared key")));
        assert!(problems.iter().any(|p| p.contains("interned")));
    }

    #[test]
    fn frozen_objects_outside_a_checkpoint_are_reported() {
        let mut cache = cache();
        let frame = cache
            .get_object(Oid(0x1000), BaseType::Page, 0, false)
            .unwrap()
            .unwrap();
        let frame = cache.prepare_for_write(frame).unwrap();
        cache.header_mut(frame).flags.insert(ObjectFlags::CKPT);
        assert!(check_consistency(&cache).is_err());
        cache.set_checkpoint_active(true);
        check_consistency(&cache).unwrap();
    }
}
