mod error;
pub mod plan;
mod read;
mod write;

#[cfg(test)]
mod tests;

pub use error::{ExecError, ExecResult};
pub use read::{CancelToken, BATCH_THRESHOLD};

use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::catalog::{Catalog, ColumnInfo, ColumnType, TableInfo};
use crate::storage::{BufferPool, DiskManager, Page, PageId, Row, StorageError};
use plan::{flatten_select, parse_plan, PlanNode};

/// Result of executing one plan document.
#[derive(Debug)]
pub enum QueryOutput {
    Rows(Vec<Row>),
    Inserted(Vec<u64>),
    Deleted(Vec<u64>),
    Updated(Vec<u64>),
}

/// The storage and execution engine: disk manager, buffer pool and
/// catalog, driven by plan documents from an external planner.
pub struct Engine {
    pub(crate) disk: DiskManager,
    pub(crate) pool: BufferPool,
    pub(crate) catalog: RwLock<Catalog>,
}

impl Engine {
    /// Open (or create) the database directory and reload the catalog and
    /// table directories.
    pub fn open<P: AsRef<Path>>(db_dir: P) -> ExecResult<Self> {
        let disk = DiskManager::open(db_dir)?;
        let catalog = Catalog::load(&disk)?;
        Ok(Self {
            disk,
            pool: BufferPool::new(),
            catalog: RwLock::new(catalog),
        })
    }

    /// DDL glue: create the table's files and register its schema.
    pub fn create_table(
        &self,
        name: &str,
        columns: &[(&str, ColumnType, bool)],
    ) -> ExecResult<()> {
        self.disk.create_table(name)?;
        let mut info = TableInfo::default();
        for (column, column_type, is_primary) in columns {
            info.schema.insert(
                column.to_string(),
                ColumnInfo {
                    column_type: *column_type,
                    is_primary: *is_primary,
                },
            );
        }
        let mut catalog = self.catalog.write().unwrap();
        catalog.add_table(name, info);
        catalog.save(&self.disk)?;
        Ok(())
    }

    /// Parse a plan document and run it.
    pub fn execute(&self, doc: &Value) -> ExecResult<QueryOutput> {
        self.execute_with_cancel(doc, &CancelToken::new())
    }

    pub fn execute_with_cancel(&self, doc: &Value, cancel: &CancelToken) -> ExecResult<QueryOutput> {
        match parse_plan(doc)? {
            PlanNode::Insert {
                table,
                columns,
                rows,
            } => Ok(QueryOutput::Inserted(self.insert(&table, &columns, &rows)?)),
            PlanNode::Delete {
                table,
                column,
                value,
            } => Ok(QueryOutput::Deleted(self.delete(&table, &column, &value)?)),
            PlanNode::Update {
                table,
                set_column,
                set_value,
                filter_column,
                filter_value,
            } => Ok(QueryOutput::Updated(self.update(
                &table,
                (set_column.as_str(), set_value.as_str()),
                (filter_column.as_str(), filter_value.as_str()),
            )?)),
            read_plan => Ok(QueryOutput::Rows(
                self.select(flatten_select(read_plan)?, cancel)?,
            )),
        }
    }

    /// Write every dirty buffer frame back to disk.
    pub fn flush(&self) -> ExecResult<()> {
        self.pool.flush_all(&self.disk)?;
        Ok(())
    }

    /// Fetch with one retry on pool exhaustion: a concurrent unpin may
    /// have freed a frame between the attempts.
    pub(crate) fn fetch_page(
        &self,
        table: &str,
        page_id: PageId,
    ) -> ExecResult<Arc<RwLock<Page>>> {
        match self.pool.fetch(&self.disk, table, page_id) {
            Err(StorageError::PoolExhausted) => Ok(self.pool.fetch(&self.disk, table, page_id)?),
            other => Ok(other?),
        }
    }
}
