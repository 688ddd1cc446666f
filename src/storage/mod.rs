mod buffer_pool;
mod codec;
mod directory;
mod disk_manager;
mod error;
mod page;

pub use buffer_pool::BufferPool;
pub use codec::{
    decode_directory, decode_page, decode_row, encode_directory, encode_page, encode_row,
    ByteReader, ByteWriter, CodecError, Row,
};
pub use directory::{level_for, Directory, EntrySnapshot, EntryState, PageEntry, LEVEL_BOUNDS};
pub use disk_manager::{DiskManager, Table};
pub use error::{StorageError, StorageResult};
pub use page::{Page, PageHeader, Slot, HEADER_SIZE, SLOT_SIZE};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Number of frames in the buffer pool
pub const BUFFER_POOL_SIZE: usize = 64;

/// Page ID type
pub type PageId = u64;

/// Generate a random 64-bit id for a row or page.
///
/// Masked to the positive `i64` range so the decimal form survives the
/// integer comparison path in filters.
pub fn random_id() -> u64 {
    rand::random::<u64>() & (i64::MAX as u64)
}
