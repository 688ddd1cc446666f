use std::collections::HashMap;
use thiserror::Error;

use crate::storage::{ByteReader, ByteWriter, CodecError, DiskManager, StorageError};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("column {column} not found on table {table}")]
    ColumnNotFound { table: String, column: String },

    #[error("table {0} has no primary column")]
    MissingPrimary(String),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Column value type as the planner and filters see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Decimal,
    Varchar,
}

impl ColumnType {
    fn tag(self) -> u8 {
        match self {
            ColumnType::Int => 0,
            ColumnType::Decimal => 1,
            ColumnType::Varchar => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(ColumnType::Int),
            1 => Ok(ColumnType::Decimal),
            2 => Ok(ColumnType::Varchar),
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnInfo {
    pub column_type: ColumnType,
    /// The primary column's value mirrors the row id.
    pub is_primary: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TableInfo {
    pub schema: HashMap<String, ColumnInfo>,
}

impl TableInfo {
    pub fn column(&self, table: &str, name: &str) -> CatalogResult<&ColumnInfo> {
        self.schema
            .get(name)
            .ok_or_else(|| CatalogError::ColumnNotFound {
                table: table.to_string(),
                column: name.to_string(),
            })
    }

    pub fn primary_column(&self, table: &str) -> CatalogResult<&str> {
        self.schema
            .iter()
            .find(|(_, info)| info.is_primary)
            .map(|(name, _)| name.as_str())
            .ok_or_else(|| CatalogError::MissingPrimary(table.to_string()))
    }
}

/// Registry of tables and their column schemas. Read-only during query
/// execution; persisted as one binary blob in `<db>/catalog`.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: HashMap<String, TableInfo>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> CatalogResult<&TableInfo> {
        self.tables
            .get(name)
            .ok_or_else(|| CatalogError::TableNotFound(name.to_string()))
    }

    pub fn add_table(&mut self, name: &str, info: TableInfo) {
        self.tables.insert(name.to_string(), info);
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Serialize tables and columns sorted by name so the encoding is
    /// deterministic.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        let mut names: Vec<&String> = self.tables.keys().collect();
        names.sort();

        w.put_u32(names.len() as u32);
        for name in names {
            let info = &self.tables[name];
            w.put_string(name);

            let mut columns: Vec<&String> = info.schema.keys().collect();
            columns.sort();
            w.put_u32(columns.len() as u32);
            for column in columns {
                let col = &info.schema[column];
                w.put_string(column);
                w.put_u8(col.column_type.tag());
                w.put_u8(col.is_primary as u8);
            }
        }
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(bytes);
        let table_count = r.read_u32()?;
        let mut tables = HashMap::new();
        for _ in 0..table_count {
            let name = r.read_string()?;
            let column_count = r.read_u32()?;
            let mut schema = HashMap::new();
            for _ in 0..column_count {
                let column = r.read_string()?;
                let column_type = ColumnType::from_tag(r.read_u8()?)?;
                let is_primary = r.read_u8()? != 0;
                schema.insert(
                    column,
                    ColumnInfo {
                        column_type,
                        is_primary,
                    },
                );
            }
            tables.insert(name, TableInfo { schema });
        }
        r.finish()?;
        Ok(Self { tables })
    }

    /// Load the catalog from the database's catalog file. An empty file is
    /// a fresh catalog.
    pub fn load(disk: &DiskManager) -> CatalogResult<Self> {
        let bytes = disk.read_catalog_bytes()?;
        if bytes.is_empty() {
            return Ok(Self::new());
        }
        Ok(Self::decode(&bytes)?)
    }

    pub fn save(&self, disk: &DiskManager) -> CatalogResult<()> {
        disk.write_catalog_bytes(&self.encode())?;
        Ok(())
    }
}
