use lru::LruCache;
use std::sync::{Arc, Mutex, RwLock};

use super::disk_manager::DiskManager;
use super::error::{StorageError, StorageResult};
use super::page::Page;
use super::{PageId, BUFFER_POOL_SIZE};

/// One cached page frame. The frame's page is the authoritative in-memory
/// copy; the table name routes eviction writes to the right data file.
struct Frame {
    page: Arc<RwLock<Page>>,
    table: String,
    pin_count: u32,
    dirty: bool,
}

/// Fixed-capacity cache of page frames keyed by page id. Victims are the
/// least-recently-used unpinned frames; dirty victims are written back
/// through the disk manager first.
pub struct BufferPool {
    frames: Mutex<LruCache<PageId, Frame>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(BUFFER_POOL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            // The cache never grows past `capacity`; eviction is manual so
            // pinned frames are never dropped behind our back.
            frames: Mutex::new(LruCache::unbounded()),
            capacity,
        }
    }

    /// Pin and return a page, loading it from disk on a miss.
    pub fn fetch(
        &self,
        disk: &DiskManager,
        table: &str,
        page_id: PageId,
    ) -> StorageResult<Arc<RwLock<Page>>> {
        let mut frames = self.frames.lock().unwrap();

        if let Some(frame) = frames.get_mut(&page_id) {
            frame.pin_count += 1;
            return Ok(frame.page.clone());
        }

        Self::ensure_space(&mut frames, self.capacity, disk)?;

        let table_obj = disk.table(table)?;
        let entry = table_obj
            .directory
            .get(page_id)
            .ok_or(StorageError::PageNotFound(page_id))?;
        let offset = entry
            .read_state()
            .offset
            .ok_or(StorageError::PageNotFound(page_id))?;
        let page = Arc::new(RwLock::new(disk.read_page_at(&table_obj, offset)?));

        frames.put(
            page_id,
            Frame {
                page: page.clone(),
                table: table.to_string(),
                pin_count: 1,
                dirty: false,
            },
        );
        Ok(page)
    }

    /// Install a page the caller already holds (fresh, or found by a file
    /// scan) and pin it. If a frame for the id exists, that copy wins and
    /// is pinned instead.
    pub fn install(
        &self,
        disk: &DiskManager,
        table: &str,
        page: Page,
    ) -> StorageResult<Arc<RwLock<Page>>> {
        let page_id = page.header.id;
        let mut frames = self.frames.lock().unwrap();

        if let Some(frame) = frames.get_mut(&page_id) {
            frame.pin_count += 1;
            return Ok(frame.page.clone());
        }

        Self::ensure_space(&mut frames, self.capacity, disk)?;

        let page = Arc::new(RwLock::new(page));
        frames.put(
            page_id,
            Frame {
                page: page.clone(),
                table: table.to_string(),
                pin_count: 1,
                dirty: false,
            },
        );
        Ok(page)
    }

    /// Release one pin; set the dirty flag if the caller mutated the page.
    pub fn unpin(&self, page_id: PageId, dirty: bool) -> StorageResult<()> {
        let mut frames = self.frames.lock().unwrap();
        let frame = frames
            .peek_mut(&page_id)
            .ok_or(StorageError::PageNotFound(page_id))?;
        if frame.pin_count == 0 {
            return Err(StorageError::NotPinned(page_id));
        }
        frame.pin_count -= 1;
        frame.dirty |= dirty;
        Ok(())
    }

    /// Write every dirty frame back to disk.
    pub fn flush_all(&self, disk: &DiskManager) -> StorageResult<()> {
        let mut frames = self.frames.lock().unwrap();
        let dirty_ids: Vec<PageId> = frames
            .iter()
            .filter(|(_, f)| f.dirty)
            .map(|(id, _)| *id)
            .collect();

        for page_id in dirty_ids {
            if let Some(frame) = frames.peek_mut(&page_id) {
                disk.write_back(&frame.table, &frame.page.read().unwrap())?;
                frame.dirty = false;
            }
        }
        Ok(())
    }

    /// Drop a frame without writing it back. Used by write paths rolling
    /// back a failed mutation so the next fetch rereads the disk image.
    pub fn discard(&self, page_id: PageId) {
        self.frames.lock().unwrap().pop(&page_id);
    }

    pub fn cached(&self, page_id: PageId) -> bool {
        self.frames.lock().unwrap().contains(&page_id)
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn pin_count(&self, page_id: PageId) -> Option<u32> {
        self.frames
            .lock()
            .unwrap()
            .peek(&page_id)
            .map(|f| f.pin_count)
    }

    /// Evict the least-recently-used unpinned frame if the pool is at
    /// capacity. `PoolExhausted` when every frame is pinned.
    fn ensure_space(
        frames: &mut LruCache<PageId, Frame>,
        capacity: usize,
        disk: &DiskManager,
    ) -> StorageResult<()> {
        while frames.len() >= capacity {
            // iter() runs most- to least-recently-used; the last unpinned
            // entry is the LRU victim.
            let victim = frames
                .iter()
                .filter(|(_, f)| f.pin_count == 0)
                .last()
                .map(|(id, _)| *id);

            let Some(victim) = victim else {
                return Err(StorageError::PoolExhausted);
            };

            if let Some(frame) = frames.peek(&victim) {
                if frame.dirty {
                    disk.write_back(&frame.table, &frame.page.read().unwrap())?;
                }
            }
            frames.pop(&victim);
        }
        Ok(())
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::{encode_row, Row};
    use crate::storage::directory::EntryState;
    use crate::storage::disk_manager::Table;
    use tempfile::TempDir;

    fn setup() -> (TempDir, DiskManager, Arc<Table>) {
        let temp_dir = tempfile::tempdir().unwrap();
        let disk = DiskManager::open(temp_dir.path().join("db")).unwrap();
        let table = disk.create_table("users").unwrap();
        (temp_dir, disk, table)
    }

    fn seed_page(disk: &DiskManager, table: &Table, page_id: PageId) {
        let mut page = Page::with_id(page_id);
        let mut row = Row::new(page_id);
        row.values
            .insert("name".to_string(), format!("user{}", page_id));
        page.insert_tuple(&encode_row(&row)).unwrap();

        let offset = disk.append_page(table, &page).unwrap();
        table.directory.register(
            page_id,
            EntryState {
                offset: Some(offset),
                slots: page.slots.clone(),
                exact_free: page.free_gap() as u16,
                level: 0,
            },
        );
    }

    #[test]
    fn test_fetch_loads_and_pins() {
        let (_t, disk, table) = setup();
        seed_page(&disk, &table, 1);
        let pool = BufferPool::with_capacity(4);

        let page = pool.fetch(&disk, "users", 1).unwrap();
        assert_eq!(page.read().unwrap().header.id, 1);
        assert_eq!(pool.pin_count(1), Some(1));

        // Second fetch hits the cache and pins again.
        let again = pool.fetch(&disk, "users", 1).unwrap();
        assert!(Arc::ptr_eq(&page, &again));
        assert_eq!(pool.pin_count(1), Some(2));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_fetch_unknown_page() {
        let (_t, disk, _table) = setup();
        let pool = BufferPool::with_capacity(4);
        let result = pool.fetch(&disk, "users", 404);
        assert!(matches!(result, Err(StorageError::PageNotFound(404))));
    }

    #[test]
    fn test_unpin_below_zero() {
        let (_t, disk, table) = setup();
        seed_page(&disk, &table, 1);
        let pool = BufferPool::with_capacity(4);

        pool.fetch(&disk, "users", 1).unwrap();
        pool.unpin(1, false).unwrap();
        let result = pool.unpin(1, false);
        assert!(matches!(result, Err(StorageError::NotPinned(1))));
    }

    #[test]
    fn test_eviction_prefers_lru_unpinned() {
        let (_t, disk, table) = setup();
        for id in 1..=3 {
            seed_page(&disk, &table, id);
        }
        let pool = BufferPool::with_capacity(2);

        pool.fetch(&disk, "users", 1).unwrap();
        pool.unpin(1, false).unwrap();
        pool.fetch(&disk, "users", 2).unwrap();
        pool.unpin(2, false).unwrap();

        // Page 1 is least recently used, so it goes.
        pool.fetch(&disk, "users", 3).unwrap();
        assert!(!pool.cached(1));
        assert!(pool.cached(2));
        assert!(pool.cached(3));
    }

    #[test]
    fn test_pinned_frames_survive_eviction() {
        let (_t, disk, table) = setup();
        for id in 1..=3 {
            seed_page(&disk, &table, id);
        }
        let pool = BufferPool::with_capacity(2);

        pool.fetch(&disk, "users", 1).unwrap(); // stays pinned
        pool.fetch(&disk, "users", 2).unwrap();
        pool.unpin(2, false).unwrap();

        pool.fetch(&disk, "users", 3).unwrap();
        assert!(pool.cached(1));
        assert!(!pool.cached(2));
    }

    #[test]
    fn test_pool_exhausted_when_all_pinned() {
        let (_t, disk, table) = setup();
        for id in 1..=3 {
            seed_page(&disk, &table, id);
        }
        let pool = BufferPool::with_capacity(2);

        pool.fetch(&disk, "users", 1).unwrap();
        pool.fetch(&disk, "users", 2).unwrap();

        let result = pool.fetch(&disk, "users", 3);
        assert!(matches!(result, Err(StorageError::PoolExhausted)));

        // An unpin makes room again.
        pool.unpin(2, false).unwrap();
        assert!(pool.fetch(&disk, "users", 3).is_ok());
    }

    #[test]
    fn test_dirty_eviction_writes_back() {
        let (_t, disk, table) = setup();
        seed_page(&disk, &table, 1);
        seed_page(&disk, &table, 2);
        let pool = BufferPool::with_capacity(1);

        let page = pool.fetch(&disk, "users", 1).unwrap();
        {
            let mut page = page.write().unwrap();
            let mut row = Row::new(9);
            row.values.insert("name".to_string(), "mutant".to_string());
            let slot = page.insert_tuple(&encode_row(&row)).unwrap();
            let entry = table.directory.get(1).unwrap();
            entry.write_state().slots.push(slot);
        }
        pool.unpin(1, true).unwrap();

        // Forces eviction of page 1, which must hit the disk first.
        pool.fetch(&disk, "users", 2).unwrap();
        assert!(!pool.cached(1));

        let reloaded = pool.fetch(&disk, "users", 1);
        // Pool is full with two pinned frames now, so free one first.
        assert!(matches!(reloaded, Err(StorageError::PoolExhausted)));
        pool.unpin(2, false).unwrap();
        let reloaded = pool.fetch(&disk, "users", 1).unwrap();
        assert_eq!(reloaded.read().unwrap().slots.len(), 2);
    }

    #[test]
    fn test_flush_all_clears_dirty() {
        let (_t, disk, table) = setup();
        seed_page(&disk, &table, 1);
        let pool = BufferPool::with_capacity(4);

        let page = pool.fetch(&disk, "users", 1).unwrap();
        {
            let mut page = page.write().unwrap();
            let mut row = Row::new(9);
            row.values.insert("name".to_string(), "flushed".to_string());
            let slot = page.insert_tuple(&encode_row(&row)).unwrap();
            table.directory.get(1).unwrap().write_state().slots.push(slot);
        }
        pool.unpin(1, true).unwrap();
        pool.flush_all(&disk).unwrap();

        let offset = table.directory.get(1).unwrap().read_state().offset.unwrap();
        let on_disk = disk.read_page_at(&table, offset).unwrap();
        assert_eq!(on_disk.slots.len(), 2);
    }

    #[test]
    fn test_install_deduplicates_by_page_id() {
        let (_t, disk, _table) = setup();
        let pool = BufferPool::with_capacity(4);

        let first = pool.install(&disk, "users", Page::with_id(5)).unwrap();
        let second = pool.install(&disk, "users", Page::with_id(5)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.pin_count(5), Some(2));
        assert_eq!(pool.len(), 1);
    }
}
