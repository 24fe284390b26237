//! Coordinator sub-modes.
//!
//! - [`pipe`]: spawns a fixed set of workers writing into one shared pipe and
//!   relays their results to a monitor over the FIFO.
//! - [`socket`]: TCP server handing out ranges on demand and streaming results
//!   to one subscribed monitor.
//! - [`shmem`]: owns the shared claim table until told to stop.

pub mod pipe;
pub mod shmem;
pub mod socket;

use std::io;

use crate::launcher::SpawnError;
use crate::partition::PartitionError;
use crate::shmem::ShmemError;

/// How a coordinator run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All work accounted for.
    Completed,
    /// Stopped by a termination request or lost workers.
    Interrupted,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Shmem(#[from] ShmemError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("limit must be at least 1")]
    InvalidLimit,
}
