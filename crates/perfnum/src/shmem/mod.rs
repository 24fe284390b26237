//! Shared-memory claim table.
//!
//! A single named region holds the search limit, a claim bitmap (one bit per
//! integer in `[1, limit]`), a small result table and a worker registry. Workers
//! in separate processes attach to it by name and claim integers one at a time.
//! Bitmap writes and result writes are each serialized by their own
//! process-shared semaphore.

mod layout;
mod semaphore;
mod table;

use std::io;

pub use layout::{FREE_PID, RESULT_SLOTS, RegionLayout, WORKER_SLOTS, WorkerRecord};
pub use semaphore::{Semaphore, SemaphoreError, SemaphoreGuard};
pub use table::{ClaimTable, Registration, WorkerSnapshot};

use crate::results::ResultsFull;

#[derive(Debug, thiserror::Error)]
pub enum ShmemError {
    #[error("cannot {action} shared memory object {name}: {source}")]
    Resource {
        action: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("shared memory object {name} is {actual} bytes, expected {expected} for limit {limit}")]
    LayoutMismatch {
        name: String,
        limit: u32,
        expected: usize,
        actual: usize,
    },

    #[error("shared memory object {name} is too short ({actual} bytes) to hold a header")]
    Truncated { name: String, actual: usize },

    #[error("limit must be at least 1")]
    InvalidLimit,

    #[error(transparent)]
    Semaphore(#[from] SemaphoreError),

    #[error(transparent)]
    Full(#[from] ResultsFull),

    #[error("all {0} worker registry slots are in use")]
    RegistryFull(usize),
}

impl ShmemError {
    fn resource(action: &'static str, name: &str, source: impl Into<io::Error>) -> Self {
        Self::Resource {
            action,
            name: name.to_owned(),
            source: source.into(),
        }
    }
}
