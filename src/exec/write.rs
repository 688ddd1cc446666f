//! INSERT, UPDATE and DELETE: page selection, slot mutation and the
//! directory bookkeeping that keeps both sides consistent.

use log::{debug, info};
use std::sync::{Arc, RwLock};

use super::error::{ExecError, ExecResult};
use super::Engine;
use crate::storage::{
    decode_row, encode_row, random_id, EntryState, Page, PageId, Row, StorageError, Table,
    SLOT_SIZE,
};

/// UPDATE re-inserts its pending rows in batches of this size.
const UPDATE_BATCH_SIZE: usize = 5;

impl Engine {
    /// Insert a batch of rows. Each row gets a fresh random id whose
    /// decimal form overwrites the primary column's value.
    pub(crate) fn insert(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<String>],
    ) -> ExecResult<Vec<u64>> {
        let primary = {
            let catalog = self.catalog.read().unwrap();
            let info = catalog.table(table)?;
            for column in columns {
                info.column(table, column)?;
            }
            info.primary_column(table)?.to_string()
        };

        let mut ids = Vec::with_capacity(rows.len());
        let mut encoded = Vec::with_capacity(rows.len());
        let mut bytes_needed = 0usize;
        for values in rows {
            if values.len() != columns.len() {
                return Err(ExecError::RowArity {
                    expected: columns.len(),
                    got: values.len(),
                });
            }
            let id = random_id();
            let mut row = Row::new(id);
            for (column, value) in columns.iter().zip(values) {
                row.values.insert(column.clone(), value.clone());
            }
            // The primary column mirrors the generated row id, replacing
            // any user-supplied value.
            row.values.insert(primary.clone(), id.to_string());

            let bytes = encode_row(&row);
            bytes_needed += bytes.len() + SLOT_SIZE;
            ids.push(id);
            encoded.push(bytes);
        }

        info!(
            "inserting {} rows ({} bytes) into {}",
            rows.len(),
            bytes_needed,
            table
        );
        self.insert_encoded(table, &encoded, bytes_needed)?;
        Ok(ids)
    }

    /// Delete every row matching `column = value`. Slots are tombstoned in
    /// the page and the directory; freed bytes flow back into
    /// `exact_free`. Returns the deleted row ids.
    pub(crate) fn delete(
        &self,
        table_name: &str,
        column: &str,
        value: &str,
    ) -> ExecResult<Vec<u64>> {
        {
            let catalog = self.catalog.read().unwrap();
            catalog.table(table_name)?.column(table_name, column)?;
        }
        let table = self.disk.table(table_name)?;

        let mut deleted = Vec::new();
        for (page_id, _offset) in table.directory.pages_in_file_order() {
            let page_arc = self.fetch_page(table_name, page_id)?;
            let entry = table
                .directory
                .get(page_id)
                .ok_or(StorageError::PageNotFound(page_id))?;
            let saved = entry.read_state().clone();

            let result = (|| -> ExecResult<Vec<u64>> {
                let mut state = entry.write_state();
                let mut page = page_arc.write().unwrap();

                let mut hits = Vec::new();
                for (index, slot) in state.slots.iter().enumerate() {
                    if slot.free {
                        continue;
                    }
                    let row = decode_row(page.slot_bytes(slot))?;
                    if row.get(column) == Some(value) {
                        hits.push((index, row.id, slot.length));
                    }
                }
                if hits.is_empty() {
                    return Ok(Vec::new());
                }

                let mut ids = Vec::with_capacity(hits.len());
                for (index, row_id, length) in hits {
                    state.slots[index].free = true;
                    page.free_slot(index);
                    state.exact_free += length;
                    ids.push(row_id);
                }
                self.disk.persist_page(&table, &page, &mut state)?;
                drop(page);
                drop(state);
                self.disk.update_directory_on_disk(&table)?;
                Ok(ids)
            })();

            match result {
                Ok(ids) => {
                    self.pool.unpin(page_id, false)?;
                    if !ids.is_empty() {
                        table.directory.separate(page_id);
                        deleted.extend(ids);
                    }
                }
                Err(err) => {
                    *entry.write_state() = saved;
                    self.pool.discard(page_id);
                    return Err(ExecError::WriteAborted(err.to_string()));
                }
            }
        }

        info!("deleted {} rows from {}", deleted.len(), table_name);
        Ok(deleted)
    }

    /// Apply `set_column = set_value` to every row matching
    /// `filter_column = filter_value`. Pass one frees the matched slots
    /// and collects the re-encoded rows; pass two re-inserts them in small
    /// batches. Row ids are preserved throughout.
    pub(crate) fn update(
        &self,
        table_name: &str,
        set: (&str, &str),
        filter: (&str, &str),
    ) -> ExecResult<Vec<u64>> {
        let (set_column, set_value) = set;
        let (filter_column, filter_value) = filter;
        {
            let catalog = self.catalog.read().unwrap();
            let info = catalog.table(table_name)?;
            info.column(table_name, set_column)?;
            info.column(table_name, filter_column)?;
        }
        let table = self.disk.table(table_name)?;

        let mut pending: Vec<(u64, Vec<u8>)> = Vec::new();
        for (page_id, _offset) in table.directory.pages_in_file_order() {
            let page_arc = self.fetch_page(table_name, page_id)?;
            let entry = table
                .directory
                .get(page_id)
                .ok_or(StorageError::PageNotFound(page_id))?;
            let saved = entry.read_state().clone();

            let result = (|| -> ExecResult<Vec<(u64, Vec<u8>)>> {
                let mut state = entry.write_state();
                let mut page = page_arc.write().unwrap();

                let mut hits = Vec::new();
                for (index, slot) in state.slots.iter().enumerate() {
                    if slot.free {
                        continue;
                    }
                    let row = decode_row(page.slot_bytes(slot))?;
                    if row.get(filter_column) == Some(filter_value) {
                        hits.push((index, row, slot.length));
                    }
                }
                if hits.is_empty() {
                    return Ok(Vec::new());
                }

                let mut page_pending = Vec::with_capacity(hits.len());
                for (index, mut row, length) in hits {
                    row.values
                        .insert(set_column.to_string(), set_value.to_string());
                    let bytes = encode_row(&row);

                    state.slots[index].free = true;
                    page.free_slot(index);
                    state.exact_free += length;
                    page_pending.push((row.id, bytes));
                }
                self.disk.persist_page(&table, &page, &mut state)?;
                drop(page);
                drop(state);
                self.disk.update_directory_on_disk(&table)?;
                Ok(page_pending)
            })();

            match result {
                Ok(page_pending) => {
                    self.pool.unpin(page_id, false)?;
                    if !page_pending.is_empty() {
                        table.directory.separate(page_id);
                        pending.extend(page_pending);
                    }
                }
                Err(err) => {
                    *entry.write_state() = saved;
                    self.pool.discard(page_id);
                    return Err(ExecError::WriteAborted(err.to_string()));
                }
            }
        }

        info!(
            "update collected {} pending rows on {}",
            pending.len(),
            table_name
        );

        let ids: Vec<u64> = pending.iter().map(|(id, _)| *id).collect();
        for batch in pending.chunks(UPDATE_BATCH_SIZE) {
            let encoded: Vec<Vec<u8>> = batch.iter().map(|(_, bytes)| bytes.clone()).collect();
            let bytes_needed = encoded.iter().map(|b| b.len() + SLOT_SIZE).sum();
            self.insert_encoded(table_name, &encoded, bytes_needed)?;
        }
        Ok(ids)
    }

    /// Append pre-encoded rows to one page and persist page then
    /// directory. On failure the in-memory entry is rolled back and the
    /// frame discarded so the next fetch rereads the disk image.
    fn insert_encoded(
        &self,
        table_name: &str,
        encoded: &[Vec<u8>],
        bytes_needed: usize,
    ) -> ExecResult<()> {
        let table = self.disk.table(table_name)?;
        let (page_arc, page_id) = self.get_available_page(&table, bytes_needed)?;
        let entry = table
            .directory
            .get(page_id)
            .ok_or(StorageError::PageNotFound(page_id))?;
        let saved = entry.read_state().clone();

        let result = (|| -> ExecResult<()> {
            let mut state = entry.write_state();
            let mut page = page_arc.write().unwrap();
            for bytes in encoded {
                let slot = page.insert_tuple(bytes)?;
                state.slots.push(slot);
                state.exact_free = state
                    .exact_free
                    .saturating_sub((bytes.len() + SLOT_SIZE) as u16);
            }
            self.disk.persist_page(&table, &page, &mut state)?;
            drop(page);
            drop(state);
            self.disk.update_directory_on_disk(&table)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.pool.unpin(page_id, false)?;
                table.directory.separate(page_id);
                debug!("insert committed on page {}", page_id);
                Ok(())
            }
            Err(err) => {
                if saved.offset.is_none() {
                    // The page was created by this call and never written;
                    // drop it from the directory entirely.
                    table.directory.unregister(page_id);
                } else {
                    *entry.write_state() = saved;
                }
                self.pool.discard(page_id);
                Err(ExecError::WriteAborted(err.to_string()))
            }
        }
    }

    /// Pick a page that can hold `bytes_needed`: level buckets first, then
    /// a data-file scan, then a fresh page registered with no offset. The
    /// returned page is pinned; the caller unpins.
    pub(crate) fn get_available_page(
        &self,
        table: &Arc<Table>,
        bytes_needed: usize,
    ) -> ExecResult<(Arc<RwLock<Page>>, PageId)> {
        let needed = bytes_needed.min(u16::MAX as usize) as u16;
        if let Some(page_id) = table.directory.find_candidate(needed) {
            debug!("level buckets steered insert to page {}", page_id);
            let page = self.fetch_page(&table.name, page_id)?;
            return Ok((page, page_id));
        }

        let (page, offset) = self.disk.find_available_page(table, bytes_needed)?;
        let page_id = page.header.id;
        match offset {
            Some(offset) => {
                debug!("file scan found page {} at offset {}", page_id, offset);
                if table.directory.get(page_id).is_none() {
                    // A stale directory file can lag the data file; adopt
                    // the on-disk image.
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
                let page = self.pool.install(&self.disk, &table.name, page)?;
                Ok((page, page_id))
            }
            None => {
                debug!("created page {} for {}", page_id, table.name);
                table.directory.register(
                    page_id,
                    EntryState {
                        offset: None,
                        slots: Vec::new(),
                        exact_free: page.free_gap() as u16,
                        level: 0,
                    },
                );
                let page = self.pool.install(&self.disk, &table.name, page)?;
                Ok((page, page_id))
            }
        }
    }
}
