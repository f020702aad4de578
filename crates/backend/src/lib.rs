//! The three backend capability interfaces a daemon hosts: object storage,
//! key-value storage, and structured data. Implementations plug in behind
//! these traits; the dispatch loop talks to nothing else.

mod db;
mod kv;
mod memory;
mod object;

pub use db::{DbBackend, DbBatch, DbIterator};
pub use kv::{KvBackend, KvBatch, KvIterator};
pub use memory::{MemoryKvBackend, MemoryObjectBackend};
pub use object::{ObjectBackend, ObjectHandle};

pub use db_types::DbError;

/// Failures of object and kv backends. `code()` is the stable projection
/// carried in per-operation reply records.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("backend i/o failure")]
    Io(#[from] std::io::Error),
    #[error("out of space")]
    OutOfSpace,
}

impl BackendError {
    pub fn code(&self) -> u32 {
        match self {
            BackendError::NotFound => 1,
            BackendError::AlreadyExists => 2,
            BackendError::Io(_) => 3,
            BackendError::OutOfSpace => 4,
        }
    }

    pub fn from_wire(code: u32) -> BackendError {
        match code {
            1 => BackendError::NotFound,
            2 => BackendError::AlreadyExists,
            4 => BackendError::OutOfSpace,
            _ => BackendError::Io(std::io::Error::other("remote backend failure")),
        }
    }
}
