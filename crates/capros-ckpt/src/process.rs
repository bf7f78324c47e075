use std::collections::BTreeMap;

use capros_store::{ReserveDirent, ThreadDirent};
use capros_types::{ObCount, Oid};

/// Hazard bit: the process was asleep when its checkpoint was taken.
pub const HAZARD_SLEEPING: u8 = 0x01;
/// Hazard bit: wake the process with a restart notification.
pub const HAZARD_WAKE_RESTART: u8 = 0x02;

/// A process the scheduler knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessEntry {
    pub oid: Oid,
    pub alloc_count: ObCount,
    pub sched_ndx: u16,
    pub hazard: u8,
}

impl ProcessEntry {
    pub fn is_sleeping(&self) -> bool {
        self.hazard & HAZARD_SLEEPING != 0
    }
}

/// Runnable and sleeping processes, by process root OID.
#[derive(Clone, Debug, Default)]
pub struct ProcessTable {
    entries: BTreeMap<Oid, ProcessEntry>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: ProcessEntry) {
        self.entries.insert(entry.oid, entry);
    }

    pub fn remove(&mut self, oid: Oid) -> Option<ProcessEntry> {
        self.entries.remove(&oid)
    }

    pub fn get(&self, oid: Oid) -> Option<&ProcessEntry> {
        self.entries.get(&oid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessEntry> {
        self.entries.values()
    }

    pub fn snapshot(&self) -> Vec<ThreadDirent> {
        self.entries
            .values()
            .map(|p| ThreadDirent {
                oid: p.oid,
                alloc_count: p.alloc_count,
                sched_ndx: p.sched_ndx,
                hazard: p.hazard,
            })
            .collect()
    }

    /// Reload one saved process. A process saved asleep is woken with a
    /// restart notification instead.
    pub fn restore(&mut self, dirent: &ThreadDirent) {
        let hazard = if dirent.hazard & HAZARD_SLEEPING != 0 {
            (dirent.hazard & !HAZARD_SLEEPING) | HAZARD_WAKE_RESTART
        } else {
            dirent.hazard
        };
        self.insert(ProcessEntry {
            oid: dirent.oid,
            alloc_count: dirent.alloc_count,
            sched_ndx: dirent.sched_ndx,
            hazard,
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A CPU reserve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reserve {
    pub priority: u8,
    pub active: bool,
    pub period_ns: u64,
    pub duration_ns: u64,
    pub quanta_ns: u64,
}

/// CPU reserves by index.
#[derive(Clone, Debug, Default)]
pub struct ReserveTable {
    reserves: BTreeMap<u16, Reserve>,
}

impl ReserveTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, index: u16, reserve: Reserve) {
        self.reserves.insert(index, reserve);
    }

    pub fn get(&self, index: u16) -> Option<&Reserve> {
        self.reserves.get(&index)
    }

    pub fn len(&self) -> usize {
        self.reserves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserves.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ReserveDirent> {
        self.reserves
            .iter()
            .map(|(&index, r)| ReserveDirent {
                index,
                priority: r.priority,
                active: r.active,
                period_ns: r.period_ns,
                duration_ns: r.duration_ns,
                quanta_ns: r.quanta_ns,
            })
            .collect()
    }

    pub fn restore(&mut self, dirent: &ReserveDirent) {
        self.set(
            dirent.index,
            Reserve {
                priority: dirent.priority,
                active: dirent.active,
                period_ns: dirent.period_ns,
                duration_ns: dirent.duration_ns,
                quanta_ns: dirent.quanta_ns,
            },
        );
    }

    pub fn clear(&mut self) {
        self.reserves.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleeping_process_is_woken_on_restore() {
        let mut table = ProcessTable::new();
        table.insert(ProcessEntry {
            oid: Oid(0x2000),
            alloc_count: 4,
            sched_ndx: 1,
            hazard: HAZARD_SLEEPING,
        });
        table.insert(ProcessEntry {
            oid: Oid(0x3000),
            alloc_count: 1,
            sched_ndx: 0,
            hazard: 0,
        });
        let saved = table.snapshot();

        let mut restored = ProcessTable::new();
        saved.iter().for_each(|d| restored.restore(d));
        let sleeper = restored.get(Oid(0x2000)).unwrap();
        assert!(!sleeper.is_sleeping());
        assert_eq!(sleeper.hazard, HAZARD_WAKE_RESTART);
        assert_eq!(restored.get(Oid(0x3000)).unwrap().hazard, 0);
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn reserves_snapshot_by_index() {
        let mut table = ReserveTable::new();
        let r = Reserve {
            priority: 3,
            active: true,
            period_ns: 10_000,
            duration_ns: 2_000,
            quanta_ns: 500,
        };
        table.set(7, r);
        table.set(2, Reserve { active: false, ..r });
        let saved = table.snapshot();
        assert_eq!(saved.iter().map(|d| d.index).collect::<Vec<_>>(), vec![2, 7]);

        let mut restored = ReserveTable::new();
        saved.iter().for_each(|d| restored.restore(d));
        assert_eq!(restored.get(7), Some(&r));
        assert!(!restored.get(2).unwrap().active);
    }
}
