use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::page::Slot;
use super::PageId;

/// Lower bounds of the free-space level buckets. A page at level `k` has
/// at least `LEVEL_BOUNDS[k]` bytes of logical free space. Monotone and
/// fixed; tests assert the ladder.
pub const LEVEL_BOUNDS: [u16; 5] = [0, 64, 256, 1024, 2048];

/// Free-space bucket for `free` bytes: the largest level whose bound is
/// still covered.
pub fn level_for(free: u16) -> u8 {
    let mut level = 0;
    for (i, bound) in LEVEL_BOUNDS.iter().enumerate() {
        if free >= *bound {
            level = i as u8;
        }
    }
    level
}

/// Per-page directory state: file offset, mirrored slot array, exact free
/// bytes and the coarse level derived from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryState {
    /// Byte offset of the page in the data file; `None` until the page is
    /// first written back.
    pub offset: Option<u64>,
    pub slots: Vec<Slot>,
    pub exact_free: u16,
    pub level: u8,
}

/// Plain copy of one entry, as serialized into the directory file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub page_id: PageId,
    pub offset: Option<u64>,
    pub slots: Vec<Slot>,
    pub exact_free: u16,
    pub level: u8,
}

/// One directory entry. Slot mutation takes the entry's own lock, not the
/// directory-wide one.
#[derive(Debug)]
pub struct PageEntry {
    state: RwLock<EntryState>,
}

impl PageEntry {
    fn new(state: EntryState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn read_state(&self) -> RwLockReadGuard<'_, EntryState> {
        self.state.read().unwrap()
    }

    pub fn write_state(&self) -> RwLockWriteGuard<'_, EntryState> {
        self.state.write().unwrap()
    }
}

/// Per-table directory: page id -> entry, plus the level buckets that
/// steer inserts. Membership changes take the directory write lock;
/// readers iterate under the read lock and then lock individual entries.
#[derive(Debug)]
pub struct Directory {
    pages: RwLock<HashMap<PageId, Arc<PageEntry>>>,
    levels: Mutex<Vec<HashSet<PageId>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(HashMap::new()),
            levels: Mutex::new(vec![HashSet::new(); LEVEL_BOUNDS.len()]),
        }
    }

    /// Rebuild a directory from its serialized entries.
    pub fn from_entries(entries: Vec<EntrySnapshot>) -> Self {
        let dir = Self::new();
        for snap in entries {
            dir.register(
                snap.page_id,
                EntryState {
                    offset: snap.offset,
                    slots: snap.slots,
                    exact_free: snap.exact_free,
                    level: snap.level,
                },
            );
        }
        dir
    }

    pub fn register(&self, page_id: PageId, mut state: EntryState) {
        state.level = level_for(state.exact_free);
        let level = state.level;
        self.pages
            .write()
            .unwrap()
            .insert(page_id, Arc::new(PageEntry::new(state)));
        self.levels.lock().unwrap()[level as usize].insert(page_id);
    }

    pub fn unregister(&self, page_id: PageId) {
        if let Some(entry) = self.pages.write().unwrap().remove(&page_id) {
            let level = entry.read_state().level;
            self.levels.lock().unwrap()[level as usize].remove(&page_id);
        }
    }

    pub fn get(&self, page_id: PageId) -> Option<Arc<PageEntry>> {
        self.pages.read().unwrap().get(&page_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.pages.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Memory separation: recompute the entry's level from its exact free
    /// bytes and move it between buckets if it changed.
    pub fn separate(&self, page_id: PageId) {
        let Some(entry) = self.get(page_id) else {
            return;
        };
        let mut state = entry.write_state();
        let new_level = level_for(state.exact_free);
        if new_level == state.level {
            return;
        }
        let old_level = state.level;
        state.level = new_level;
        drop(state);

        let mut levels = self.levels.lock().unwrap();
        levels[old_level as usize].remove(&page_id);
        levels[new_level as usize].insert(page_id);
    }

    /// Steering step of the insert path: find a page whose level bucket
    /// guarantees `needed` bytes, verifying `exact_free` under the entry
    /// lock. Smaller qualifying levels are preferred.
    pub fn find_candidate(&self, needed: u16) -> Option<PageId> {
        let start = LEVEL_BOUNDS
            .iter()
            .position(|bound| *bound >= needed)
            .unwrap_or(LEVEL_BOUNDS.len() - 1);

        let candidates: Vec<Vec<PageId>> = {
            let levels = self.levels.lock().unwrap();
            levels[start..]
                .iter()
                .map(|bucket| bucket.iter().copied().collect())
                .collect()
        };

        for bucket in candidates {
            for page_id in bucket {
                if let Some(entry) = self.get(page_id) {
                    if entry.read_state().exact_free >= needed {
                        return Some(page_id);
                    }
                }
            }
        }
        None
    }

    /// All pages that exist on disk, in data-file order.
    pub fn pages_in_file_order(&self) -> Vec<(PageId, u64)> {
        let pages = self.pages.read().unwrap();
        let mut ordered: Vec<(PageId, u64)> = pages
            .iter()
            .filter_map(|(id, entry)| entry.read_state().offset.map(|off| (*id, off)))
            .collect();
        ordered.sort_by_key(|(_, off)| *off);
        ordered
    }

    /// Plain copy of every entry, sorted by page id, for serialization.
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let pages = self.pages.read().unwrap();
        let mut entries: Vec<EntrySnapshot> = pages
            .iter()
            .map(|(id, entry)| {
                let state = entry.read_state();
                EntrySnapshot {
                    page_id: *id,
                    offset: state.offset,
                    slots: state.slots.clone(),
                    exact_free: state.exact_free,
                    level: state.level,
                }
            })
            .collect();
        entries.sort_by_key(|e| e.page_id);
        entries
    }

    /// Sum of `exact_free` over all pages. Used by accounting tests.
    pub fn total_free(&self) -> u64 {
        let pages = self.pages.read().unwrap();
        pages
            .values()
            .map(|entry| entry.read_state().exact_free as u64)
            .sum()
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}
