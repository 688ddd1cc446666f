use std::io;
use thiserror::Error;

use super::codec::CodecError;
use super::PageId;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("IO error on {file} at offset {offset}: {source}")]
    PageIo {
        file: String,
        offset: u64,
        source: io::Error,
    },

    #[error("short read on {file} at offset {offset}: {got} of {expected} bytes")]
    ShortRead {
        file: String,
        offset: u64,
        got: usize,
        expected: usize,
    },

    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("table {0} already exists")]
    TableAlreadyExists(String),

    #[error("page {0} not found")]
    PageNotFound(PageId),

    #[error("page {page_id} full: {free} bytes free, {needed} needed")]
    PageFull {
        page_id: PageId,
        free: usize,
        needed: usize,
    },

    #[error("buffer pool has no evictable frame")]
    PoolExhausted,

    #[error("page {0} is not pinned")]
    NotPinned(PageId),
}

pub type StorageResult<T> = Result<T, StorageError>;
