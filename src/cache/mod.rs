//! Persistent cache generations
//!
//! This module stores intercepted responses on disk, grouped into named
//! generations (one directory each). A generation keeps its keys in
//! insertion order so callers can bound its size by evicting the oldest
//! entries, and a new generation can be filled off to the side and published
//! atomically once it is complete.

mod storage;
mod store;

use std::path::PathBuf;

use thiserror::Error;

pub use storage::{CacheStorage, StagedGeneration};
pub use store::{CacheStore, CachedResponse};

/// Errors that can occur when reading or writing a cache generation
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem operation failed
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A file in the generation could not be (de)serialized
    #[error("corrupt cache file {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A stored body was not valid base64
    #[error("corrupt cached body: {0}")]
    Body(#[from] base64::DecodeError),

    /// Generation names must be usable as a directory name
    #[error("invalid cache generation name: '{0}'")]
    InvalidName(String),
}
