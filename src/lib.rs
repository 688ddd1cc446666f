pub mod catalog;
pub mod exec;
pub mod storage;

pub use exec::{CancelToken, Engine, ExecError, ExecResult, QueryOutput};
pub use storage::{Row, BUFFER_POOL_SIZE, PAGE_SIZE};
