use std::collections::{BTreeMap, BTreeSet};

use capros_store::CkptDirent;
use capros_types::{BaseType, GenNum, Lid, ObCount, Oid};
use tracing::trace;

use crate::error::{PersistError, PersistResult};

/// Where one version of an object lives in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub oid: Oid,
    pub alloc_count: ObCount,
    /// Nodes only.
    pub call_count: ObCount,
    /// `ZERO_LID` for a zero page or an empty node.
    pub log_loc: Lid,
    pub base_type: BaseType,
}

impl ObjectDescriptor {
    /// The count recorded in a directory page.
    pub fn dirent_count(&self) -> ObCount {
        match self.base_type {
            BaseType::Page => self.alloc_count,
            BaseType::Node => self.alloc_count.max(self.call_count),
        }
    }

    pub fn to_dirent(&self) -> CkptDirent {
        CkptDirent {
            oid: self.oid,
            count: self.dirent_count(),
            lid: self.log_loc,
            base_type: self.base_type,
        }
    }

    /// Directory pages keep one count; restart gives it to both counts of a node.
    pub fn from_dirent(d: &CkptDirent) -> Self {
        Self {
            oid: d.oid,
            alloc_count: d.count,
            call_count: match d.base_type {
                BaseType::Page => 0,
                BaseType::Node => d.count,
            },
            log_loc: d.lid,
            base_type: d.base_type,
        }
    }
}

/// The log directory's record for one OID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub od: ObjectDescriptor,
    pub generation: GenNum,
    /// The version from an older, not yet migrated generation that this
    /// entry superseded. Migration of that generation still needs it.
    pub previous: Option<(ObjectDescriptor, GenNum)>,
}

/// In-memory index from OID to the newest logged version of the object.
///
/// Every entry belongs to exactly one generation. Generations at or below
/// the last retired one are never tracked.
#[derive(Debug)]
pub struct LogDirectory {
    entries: BTreeMap<Oid, DirEntry>,
    by_generation: BTreeMap<GenNum, BTreeSet<Oid>>,
    capacity: usize,
    max_generations: usize,
    retired: GenNum,
}

impl LogDirectory {
    pub fn new(capacity: usize, max_generations: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            by_generation: BTreeMap::new(),
            capacity,
            max_generations,
            retired: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_available_entries(&self) -> usize {
        self.capacity - self.entries.len()
    }

    /// Entries recorded in `generation`.
    pub fn num_working_entries(&self, generation: GenNum) -> usize {
        self.by_generation.get(&generation).map_or(0, BTreeSet::len)
    }

    /// Generations with at least one entry, oldest first.
    pub fn generations(&self) -> Vec<GenNum> {
        self.by_generation.keys().copied().collect()
    }

    pub fn last_retired(&self) -> GenNum {
        self.retired
    }

    /// Whether `generation` already has entries or a new one still fits.
    pub fn has_room_for_generation(&self, generation: GenNum) -> bool {
        self.by_generation.contains_key(&generation) || self.by_generation.len() < self.max_generations
    }

    /// Fail the way [`record_location`](Self::record_location) would if
    /// `oid` were recorded in `generation` now.
    pub fn check_room(&self, oid: Oid, generation: GenNum) -> PersistResult<()> {
        let existing = self.entries.get(&oid);
        if existing.is_none() && self.entries.len() >= self.capacity {
            return Err(PersistError::DirectoryFull {
                capacity: self.capacity,
            });
        }
        let empties_old = existing.is_some_and(|e| {
            e.generation < generation && self.num_working_entries(e.generation) == 1
        });
        if !self.has_room_for_generation(generation) && !empties_old {
            return Err(PersistError::TooManyGenerations {
                max: self.max_generations,
            });
        }
        Ok(())
    }

    /// Record that `od` was written to the log in `generation`.
    ///
    /// Replaces any older entry for the OID. If the older entry belongs to
    /// an earlier generation that is not retired, it is kept as the
    /// previous version so migration of that generation still finds it.
    pub fn record_location(&mut self, od: ObjectDescriptor, generation: GenNum) -> PersistResult<()> {
        self.check_room(od.oid, generation)?;
        let existing = self.entries.get(&od.oid).copied();

        let previous = match existing {
            Some(old) if old.generation < generation => {
                self.forget_in_generation(old.generation, od.oid);
                (old.generation > self.retired).then_some((old.od, old.generation))
            }
            Some(old) if old.generation > generation => {
                trace!(oid = %od.oid, old = old.generation, new = generation, "ignoring older location");
                return Ok(());
            }
            Some(old) => old.previous,
            None => None,
        };
        self.entries.insert(
            od.oid,
            DirEntry {
                od,
                generation,
                previous,
            },
        );
        self.by_generation.entry(generation).or_default().insert(od.oid);
        trace!(oid = %od.oid, lid = %od.log_loc, generation, "recorded location");
        Ok(())
    }

    fn forget_in_generation(&mut self, generation: GenNum, oid: Oid) {
        if let Some(set) = self.by_generation.get_mut(&generation) {
            set.remove(&oid);
            if set.is_empty() {
                self.by_generation.remove(&generation);
            }
        }
    }

    pub fn find_object(&self, oid: Oid) -> Option<&ObjectDescriptor> {
        self.entries.get(&oid).map(|e| &e.od)
    }

    pub fn entry(&self, oid: Oid) -> Option<&DirEntry> {
        self.entries.get(&oid)
    }

    /// Log location of `oid`, if the logged version has `alloc_count`.
    pub fn lookup(&self, oid: Oid, alloc_count: ObCount) -> Option<Lid> {
        self.find_object(oid)
            .filter(|od| od.alloc_count == alloc_count)
            .map(|od| od.log_loc)
    }

    /// The version of `oid` that was current as of `generation`.
    pub fn find_object_for_journal(&self, oid: Oid, generation: GenNum) -> Option<ObjectDescriptor> {
        let entry = self.entries.get(&oid)?;
        if entry.generation <= generation {
            return Some(entry.od);
        }
        entry
            .previous
            .filter(|(_, g)| *g <= generation)
            .map(|(od, _)| od)
    }

    /// Entries whose newest version was written in `generation`, by OID.
    pub fn generation_entries(&self, generation: GenNum) -> Vec<ObjectDescriptor> {
        self.by_generation
            .get(&generation)
            .into_iter()
            .flatten()
            .filter_map(|oid| self.entries.get(oid).map(|e| e.od))
            .collect()
    }

    /// Every version written in `generation` that still needs a home,
    /// including versions since superseded by a newer generation.
    pub fn migration_snapshot(&self, generation: GenNum) -> Vec<ObjectDescriptor> {
        let mut snapshot: BTreeMap<Oid, ObjectDescriptor> = self
            .generation_entries(generation)
            .into_iter()
            .map(|od| (od.oid, od))
            .collect();
        for entry in self.entries.values() {
            if let Some((od, g)) = entry.previous {
                if g == generation {
                    snapshot.insert(od.oid, od);
                }
            }
        }
        snapshot.into_values().collect()
    }

    /// Drop everything recorded in `generation` or earlier.
    pub fn clear_generation(&mut self, generation: GenNum) {
        let retired: Vec<GenNum> = self.by_generation.range(..=generation).map(|(g, _)| *g).collect();
        for g in retired {
            if let Some(oids) = self.by_generation.remove(&g) {
                for oid in oids {
                    self.entries.remove(&oid);
                }
            }
        }
        for entry in self.entries.values_mut() {
            if entry.previous.is_some_and(|(_, g)| g <= generation) {
                entry.previous = None;
            }
        }
        self.generation_retired(generation);
    }

    /// Versions from `generation` and earlier are safely home.
    pub fn generation_retired(&mut self, generation: GenNum) {
        self.retired = self.retired.max(generation);
    }

    pub fn remove_object_entry(&mut self, oid: Oid) -> Option<DirEntry> {
        let entry = self.entries.remove(&oid)?;
        self.forget_in_generation(entry.generation, oid);
        Some(entry)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_generation.clear();
        self.retired = 0;
    }
}
