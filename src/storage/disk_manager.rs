use log::debug;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use super::codec::{decode_directory, decode_page, encode_directory, encode_page};
use super::directory::{Directory, EntryState};
use super::error::{StorageError, StorageResult};
use super::page::Page;
use super::PAGE_SIZE;

/// One table's on-disk presence: the data file (concatenated pages), the
/// directory file (one serialized directory, rewritten in place) and the
/// in-memory directory.
pub struct Table {
    pub name: String,
    data_file: Mutex<File>,
    dir_file: Mutex<File>,
    pub directory: Directory,
}

impl Table {
    fn data_file_name(&self) -> String {
        format!("Tables/{}/data", self.name)
    }

    fn dir_file_name(&self) -> String {
        format!("Tables/{}/dir", self.name)
    }
}

/// Owns the database directory: the catalog file and each table's data
/// and directory files. All page IO goes through here at page-aligned
/// offsets.
pub struct DiskManager {
    db_dir: PathBuf,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl DiskManager {
    /// Open an existing database directory or create a fresh one. Existing
    /// tables are reopened and their directories reloaded from disk.
    pub fn open<P: AsRef<Path>>(db_dir: P) -> StorageResult<Self> {
        let db_dir = db_dir.as_ref().to_path_buf();
        let tables_dir = db_dir.join("Tables");
        fs::create_dir_all(&tables_dir)?;

        let catalog_path = db_dir.join("catalog");
        if !catalog_path.exists() {
            File::create(&catalog_path)?;
            debug!("created database directory at {}", db_dir.display());
        }

        let manager = Self {
            db_dir,
            tables: RwLock::new(HashMap::new()),
        };

        for dir_entry in fs::read_dir(&tables_dir)? {
            let dir_entry = dir_entry?;
            if dir_entry.file_type()?.is_dir() {
                let name = dir_entry.file_name().to_string_lossy().into_owned();
                let table = manager.open_table(&name)?;
                manager
                    .tables
                    .write()
                    .unwrap()
                    .insert(name.clone(), table);
                debug!("reopened table {}", name);
            }
        }

        Ok(manager)
    }

    fn table_dir(&self, name: &str) -> PathBuf {
        self.db_dir.join("Tables").join(name)
    }

    fn open_table(&self, name: &str) -> StorageResult<Arc<Table>> {
        let dir = self.table_dir(name);
        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join("data"))?;
        let mut dir_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join("dir"))?;

        let mut bytes = Vec::new();
        dir_file.read_to_end(&mut bytes)?;
        let directory = if bytes.is_empty() {
            Directory::new()
        } else {
            Directory::from_entries(decode_directory(&bytes)?)
        };

        Ok(Arc::new(Table {
            name: name.to_string(),
            data_file: Mutex::new(data_file),
            dir_file: Mutex::new(dir_file),
            directory,
        }))
    }

    /// Create the files for a new table and register it with an empty
    /// directory.
    pub fn create_table(&self, name: &str) -> StorageResult<Arc<Table>> {
        if self.tables.read().unwrap().contains_key(name) {
            return Err(StorageError::TableAlreadyExists(name.to_string()));
        }

        let dir = self.table_dir(name);
        fs::create_dir_all(&dir)?;
        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dir.join("data"))?;
        let mut dir_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dir.join("dir"))?;
        dir_file.write_all(&encode_directory(&[]))?;

        let table = Arc::new(Table {
            name: name.to_string(),
            data_file: Mutex::new(data_file),
            dir_file: Mutex::new(dir_file),
            directory: Directory::new(),
        });
        self.tables
            .write()
            .unwrap()
            .insert(name.to_string(), table.clone());
        debug!("created table {}", name);
        Ok(table)
    }

    pub fn table(&self, name: &str) -> StorageResult<Arc<Table>> {
        self.tables
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().unwrap().keys().cloned().collect()
    }

    /// Raw catalog file contents; empty for a fresh database.
    pub fn read_catalog_bytes(&self) -> StorageResult<Vec<u8>> {
        Ok(fs::read(self.db_dir.join("catalog"))?)
    }

    pub fn write_catalog_bytes(&self, bytes: &[u8]) -> StorageResult<()> {
        fs::write(self.db_dir.join("catalog"), bytes)?;
        Ok(())
    }

    /// Overwrite a page in place at a known offset.
    pub fn write_page_at(&self, table: &Table, page: &Page, offset: u64) -> StorageResult<()> {
        let bytes = encode_page(page);
        let mut file = table.data_file.lock().unwrap();
        let file_name = table.data_file_name();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(&bytes))
            .map_err(|source| StorageError::PageIo {
                file: file_name,
                offset,
                source,
            })
    }

    /// Write a page at end-of-file and return its offset.
    pub fn append_page(&self, table: &Table, page: &Page) -> StorageResult<u64> {
        let bytes = encode_page(page);
        let mut file = table.data_file.lock().unwrap();
        let file_name = table.data_file_name();
        let offset = file
            .seek(SeekFrom::End(0))
            .map_err(|source| StorageError::PageIo {
                file: file_name.clone(),
                offset: 0,
                source,
            })?;
        file.write_all(&bytes).map_err(|source| StorageError::PageIo {
            file: file_name,
            offset,
            source,
        })?;
        Ok(offset)
    }

    /// Read and decode the page at `offset`. Reading past end-of-file is a
    /// short read here; only `find_available_page` treats EOF as a signal.
    pub fn read_page_at(&self, table: &Table, offset: u64) -> StorageResult<Page> {
        let mut file = table.data_file.lock().unwrap();
        match Self::read_page_bytes(&mut file, offset, &table.data_file_name())? {
            Some(bytes) => Ok(decode_page(&bytes)?),
            None => Err(StorageError::ShortRead {
                file: table.data_file_name(),
                offset,
                got: 0,
                expected: PAGE_SIZE,
            }),
        }
    }

    /// Serialize the table's directory and rewrite its file at offset 0.
    pub fn update_directory_on_disk(&self, table: &Table) -> StorageResult<()> {
        let bytes = encode_directory(&table.directory.snapshot());
        let mut file = table.dir_file.lock().unwrap();
        let written = (|| {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&bytes)
        })();
        written.map_err(|source| StorageError::PageIo {
            file: table.dir_file_name(),
            offset: 0,
            source,
        })
    }

    /// Scan the data file at page-aligned offsets for the first page whose
    /// free gap admits `bytes_needed`. On end-of-file a freshly
    /// initialized page is returned with no offset.
    pub fn find_available_page(
        &self,
        table: &Table,
        bytes_needed: usize,
    ) -> StorageResult<(Page, Option<u64>)> {
        let mut file = table.data_file.lock().unwrap();
        let file_name = table.data_file_name();
        let mut offset = 0u64;
        loop {
            match Self::read_page_bytes(&mut file, offset, &file_name)? {
                None => {
                    debug!("data file {} exhausted, creating fresh page", file_name);
                    return Ok((Page::new(), None));
                }
                Some(bytes) => {
                    let page = decode_page(&bytes)?;
                    if page.free_gap() >= bytes_needed {
                        return Ok((page, Some(offset)));
                    }
                }
            }
            offset += PAGE_SIZE as u64;
        }
    }

    /// Write a page back through its directory entry: in place when the
    /// entry has an offset, appended otherwise (the offset is recorded).
    pub fn persist_page(
        &self,
        table: &Table,
        page: &Page,
        state: &mut EntryState,
    ) -> StorageResult<()> {
        match state.offset {
            Some(offset) => self.write_page_at(table, page, offset),
            None => {
                let offset = self.append_page(table, page)?;
                state.offset = Some(offset);
                Ok(())
            }
        }
    }

    /// Eviction/flush write-back for a frame the pool owns.
    pub fn write_back(&self, table_name: &str, page: &Page) -> StorageResult<()> {
        let table = self.table(table_name)?;
        let entry = table
            .directory
            .get(page.header.id)
            .ok_or(StorageError::PageNotFound(page.header.id))?;
        let mut state = entry.write_state();
        self.persist_page(&table, page, &mut state)
    }

    /// Read exactly one page of bytes, or `None` at end-of-file. A partial
    /// page is an error.
    fn read_page_bytes(
        file: &mut File,
        offset: u64,
        file_name: &str,
    ) -> StorageResult<Option<Vec<u8>>> {
        file.seek(SeekFrom::Start(offset))
            .map_err(|source| StorageError::PageIo {
                file: file_name.to_string(),
                offset,
                source,
            })?;

        let mut buf = vec![0u8; PAGE_SIZE];
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = file
                .read(&mut buf[filled..])
                .map_err(|source| StorageError::PageIo {
                    file: file_name.to_string(),
                    offset,
                    source,
                })?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        match filled {
            0 => Ok(None),
            n if n < PAGE_SIZE => Err(StorageError::ShortRead {
                file: file_name.to_string(),
                offset,
                got: n,
                expected: PAGE_SIZE,
            }),
            _ => Ok(Some(buf)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::{encode_row, Row};
    use crate::storage::page::{HEADER_SIZE, SLOT_SIZE};
    use tempfile::TempDir;

    fn setup() -> (TempDir, DiskManager) {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = DiskManager::open(temp_dir.path().join("db")).unwrap();
        (temp_dir, manager)
    }

    fn sample_page() -> Page {
        let mut page = Page::with_id(77);
        let mut row = Row::new(1);
        row.values.insert("name".to_string(), "alice".to_string());
        page.insert_tuple(&encode_row(&row)).unwrap();
        page
    }

    #[test]
    fn test_open_creates_layout() {
        let (temp_dir, _manager) = setup();
        let db = temp_dir.path().join("db");
        assert!(db.join("catalog").exists());
        assert!(db.join("Tables").is_dir());
    }

    #[test]
    fn test_create_table_files() {
        let (temp_dir, manager) = setup();
        manager.create_table("users").unwrap();
        let dir = temp_dir.path().join("db/Tables/users");
        assert!(dir.join("data").exists());
        assert!(dir.join("dir").exists());
        assert!(manager.table("users").is_ok());
    }

    #[test]
    fn test_create_table_twice_fails() {
        let (_temp_dir, manager) = setup();
        manager.create_table("users").unwrap();
        let result = manager.create_table("users");
        assert!(matches!(result, Err(StorageError::TableAlreadyExists(_))));
    }

    #[test]
    fn test_missing_table() {
        let (_temp_dir, manager) = setup();
        assert!(matches!(
            manager.table("ghost"),
            Err(StorageError::TableNotFound(_))
        ));
    }

    #[test]
    fn test_append_and_read_page() {
        let (_temp_dir, manager) = setup();
        let table = manager.create_table("users").unwrap();
        let page = sample_page();

        let offset = manager.append_page(&table, &page).unwrap();
        assert_eq!(offset, 0);

        let read = manager.read_page_at(&table, offset).unwrap();
        assert_eq!(read.header.id, page.header.id);
        assert_eq!(read.slots, page.slots);

        let second = Page::with_id(78);
        let offset2 = manager.append_page(&table, &second).unwrap();
        assert_eq!(offset2, PAGE_SIZE as u64);
    }

    #[test]
    fn test_write_page_in_place() {
        let (_temp_dir, manager) = setup();
        let table = manager.create_table("users").unwrap();
        let mut page = sample_page();
        let offset = manager.append_page(&table, &page).unwrap();

        let mut row = Row::new(2);
        row.values.insert("name".to_string(), "bob".to_string());
        page.insert_tuple(&encode_row(&row)).unwrap();
        manager.write_page_at(&table, &page, offset).unwrap();

        let read = manager.read_page_at(&table, offset).unwrap();
        assert_eq!(read.slots.len(), 2);
    }

    #[test]
    fn test_read_past_eof_is_error() {
        let (_temp_dir, manager) = setup();
        let table = manager.create_table("users").unwrap();
        let result = manager.read_page_at(&table, 0);
        assert!(matches!(result, Err(StorageError::ShortRead { .. })));
    }

    #[test]
    fn test_partial_page_is_short_read() {
        let (temp_dir, manager) = setup();
        let table = manager.create_table("users").unwrap();
        manager.append_page(&table, &sample_page()).unwrap();

        // Truncate the data file mid-page.
        let data_path = temp_dir.path().join("db/Tables/users/data");
        let file = OpenOptions::new().write(true).open(data_path).unwrap();
        file.set_len(4000).unwrap();

        let result = manager.read_page_at(&table, 0);
        assert!(matches!(
            result,
            Err(StorageError::ShortRead { got: 4000, .. })
        ));
    }

    #[test]
    fn test_find_available_page_eof_gives_fresh_page() {
        let (_temp_dir, manager) = setup();
        let table = manager.create_table("users").unwrap();

        let (page, offset) = manager.find_available_page(&table, 100).unwrap();
        assert!(offset.is_none());
        assert_eq!(page.free_gap(), PAGE_SIZE - HEADER_SIZE);
    }

    #[test]
    fn test_find_available_page_skips_full_pages() {
        let (_temp_dir, manager) = setup();
        let table = manager.create_table("users").unwrap();

        let mut full = Page::with_id(1);
        let filler = vec![9u8; full.free_gap() - SLOT_SIZE];
        full.insert_tuple(&filler).unwrap();
        manager.append_page(&table, &full).unwrap();

        let roomy = Page::with_id(2);
        manager.append_page(&table, &roomy).unwrap();

        let (found, offset) = manager.find_available_page(&table, 100).unwrap();
        assert_eq!(found.header.id, 2);
        assert_eq!(offset, Some(PAGE_SIZE as u64));
    }

    #[test]
    fn test_directory_persists_and_reloads() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = temp_dir.path().join("db");
        let page_id;
        {
            let manager = DiskManager::open(&db).unwrap();
            let table = manager.create_table("users").unwrap();
            let page = sample_page();
            page_id = page.header.id;
            let offset = manager.append_page(&table, &page).unwrap();
            table.directory.register(
                page_id,
                EntryState {
                    offset: Some(offset),
                    slots: page.slots.clone(),
                    exact_free: page.free_gap() as u16,
                    level: 0,
                },
            );
            manager.update_directory_on_disk(&table).unwrap();
        }

        let manager = DiskManager::open(&db).unwrap();
        let table = manager.table("users").unwrap();
        let entry = table.directory.get(page_id).unwrap();
        let state = entry.read_state();
        assert_eq!(state.offset, Some(0));
        assert_eq!(state.slots.len(), 1);
    }

    #[test]
    fn test_persist_page_assigns_offset_once() {
        let (_temp_dir, manager) = setup();
        let table = manager.create_table("users").unwrap();
        let page = sample_page();
        let mut state = EntryState {
            offset: None,
            slots: page.slots.clone(),
            exact_free: page.free_gap() as u16,
            level: 0,
        };

        manager.persist_page(&table, &page, &mut state).unwrap();
        assert_eq!(state.offset, Some(0));

        // Second persist goes in place, not at EOF.
        manager.persist_page(&table, &page, &mut state).unwrap();
        assert_eq!(state.offset, Some(0));
        let read = manager.read_page_at(&table, PAGE_SIZE as u64);
        assert!(read.is_err());
    }
}
