use thiserror::Error;

use super::plan::PlanError;
use crate::catalog::CatalogError;
use crate::storage::{CodecError, StorageError};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("write aborted: {0}")]
    WriteAborted(String),

    #[error("query cancelled")]
    Cancelled,

    #[error("column {0} missing from row")]
    MissingColumn(String),

    #[error("value {value:?} in column {column} is not an integer")]
    NotAnInteger { column: String, value: String },

    #[error("row has {got} values for {expected} columns")]
    RowArity { expected: usize, got: usize },
}

pub type ExecResult<T> = Result<T, ExecError>;
