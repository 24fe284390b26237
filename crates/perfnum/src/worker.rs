//! Worker loops for the three transports.
//!
//! The predicate scan itself is blocking CPU work, so it runs on the blocking
//! pool and streams hits back through an unbounded channel; the async side
//! forwards each hit as a `PerfNum` packet. Shutdown is checked between numbers.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::bridge::protocol::{PID_SERVER, Packet, ProtocolError};
use crate::partition::{PartitionError, WorkRange};
use crate::predicate::Predicate;
use crate::shmem::{ClaimTable, ShmemError};
use crate::shutdown::ShutdownFlag;

/// How a worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// No work left.
    Exhausted,
    /// Stopped early by a termination request.
    Aborted,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid assignment: {0}")]
    Assignment(#[from] PartitionError),
    #[error(transparent)]
    Shmem(#[from] ShmemError),
    #[error("coordinator closed the connection")]
    CoordinatorGone,
    #[error("scan task failed: {0}")]
    Join(String),
}

/// Sends hits from the blocking scan back to the async side.
#[derive(Debug, Clone)]
pub struct HitSender {
    tx: mpsc::UnboundedSender<u32>,
}

impl HitSender {
    pub fn new(tx: mpsc::UnboundedSender<u32>) -> Self {
        Self { tx }
    }

    pub fn send(&self, value: u32) -> io::Result<()> {
        self.tx
            .send(value)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "hit channel closed"))
    }
}

/// Test every integer in `range`, in order.
///
/// Returns `Aborted` if `shutdown` is set between two numbers or the receiving
/// side of `hits` has gone away.
pub fn scan_range<P: Predicate + ?Sized>(
    predicate: &P,
    range: WorkRange,
    shutdown: &AtomicBool,
    hits: &HitSender,
) -> WorkerOutcome {
    for n in range.iter() {
        if shutdown.load(Ordering::SeqCst) {
            tracing::debug!(at = n, "Scan interrupted");
            return WorkerOutcome::Aborted;
        }
        if predicate.is_target(n) && hits.send(n).is_err() {
            return WorkerOutcome::Aborted;
        }
    }
    WorkerOutcome::Exhausted
}

/// Scan `range` on the blocking pool, forwarding each hit to `writer` as it arrives.
async fn scan_and_forward<P, W>(
    predicate: &Arc<P>,
    range: WorkRange,
    shutdown: &ShutdownFlag,
    writer: &mut W,
) -> Result<WorkerOutcome, WorkerError>
where
    P: Predicate,
    W: Sink<Packet, Error = io::Error> + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let hits = HitSender::new(tx);
    let predicate = Arc::clone(predicate);
    let cell = shutdown.cell();

    tracing::debug!(start = range.start(), end = range.end(), "Testing range");
    let task =
        tokio::task::spawn_blocking(move || scan_range(predicate.as_ref(), range, &cell, &hits));

    while let Some(value) = rx.recv().await {
        tracing::info!(value, "Found");
        writer.send(Packet::PerfNum { value }).await?;
    }

    task.await.map_err(|e| WorkerError::Join(e.to_string()))
}

/// Pipe mode: test a fixed range, then send `Done` (or `Closed` if interrupted).
pub async fn run_pipe_worker<P, W>(
    predicate: Arc<P>,
    range: WorkRange,
    writer: &mut W,
    shutdown: &ShutdownFlag,
) -> Result<WorkerOutcome, WorkerError>
where
    P: Predicate,
    W: Sink<Packet, Error = io::Error> + Unpin,
{
    let pid = std::process::id() as i32;
    tracing::info!(pid, start = range.start(), end = range.end(), "Pipe worker starting");

    let outcome = scan_and_forward(&predicate, range, shutdown, writer).await?;
    let last = match outcome {
        WorkerOutcome::Exhausted => Packet::Done { pid },
        WorkerOutcome::Aborted => Packet::Closed { pid },
    };
    writer.send(last).await?;

    tracing::info!(pid, ?outcome, "Pipe worker finished");
    Ok(outcome)
}

/// Socket mode: request ranges with `Done` until the coordinator answers `Refuse`.
pub async fn run_socket_worker<P, R, W>(
    predicate: Arc<P>,
    reader: &mut R,
    writer: &mut W,
    shutdown: &ShutdownFlag,
) -> Result<WorkerOutcome, WorkerError>
where
    P: Predicate,
    R: Stream<Item = io::Result<Result<Packet, ProtocolError>>> + Unpin,
    W: Sink<Packet, Error = io::Error> + Unpin,
{
    let pid = std::process::id() as i32;
    let mut ranges_done = 0u32;

    loop {
        if shutdown.is_requested() {
            writer.send(Packet::Closed { pid }).await?;
            return Ok(WorkerOutcome::Aborted);
        }
        writer.send(Packet::Done { pid }).await?;

        let reply = loop {
            let frame = tokio::select! {
                _ = shutdown.wait() => {
                    writer.send(Packet::Closed { pid }).await?;
                    return Ok(WorkerOutcome::Aborted);
                }
                frame = reader.next() => frame,
            };
            match frame {
                None => return Err(WorkerError::CoordinatorGone),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Err(e))) => tracing::warn!(error = %e, "Dropping invalid packet"),
                Some(Ok(Ok(packet))) => break packet,
            }
        };

        match reply {
            Packet::Range { start, end } => {
                let range = WorkRange::new(start, end)?;
                if scan_and_forward(&predicate, range, shutdown, writer).await?
                    == WorkerOutcome::Aborted
                {
                    writer.send(Packet::Closed { pid }).await?;
                    return Ok(WorkerOutcome::Aborted);
                }
                ranges_done += 1;
            }
            Packet::Refuse => {
                tracing::info!(pid, ranges_done, "No work left");
                return Ok(WorkerOutcome::Exhausted);
            }
            Packet::Closed { pid: PID_SERVER } => {
                tracing::warn!("Coordinator shut down");
                return Ok(WorkerOutcome::Aborted);
            }
            other => {
                tracing::warn!(error = %other.unexpected(), "Ignoring packet");
            }
        }
    }
}

/// Shared-memory mode: claim and test integers until none remain.
///
/// The worker's registry slot is released on every exit path.
pub async fn run_shmem_worker<P: Predicate>(
    predicate: Arc<P>,
    table: Arc<ClaimTable>,
    shutdown: &ShutdownFlag,
) -> Result<WorkerOutcome, WorkerError> {
    let cell = shutdown.cell();
    tokio::task::spawn_blocking(move || claim_loop(predicate.as_ref(), &table, &cell))
        .await
        .map_err(|e| WorkerError::Join(e.to_string()))?
}

fn claim_loop<P: Predicate + ?Sized>(
    predicate: &P,
    table: &ClaimTable,
    shutdown: &AtomicBool,
) -> Result<WorkerOutcome, WorkerError> {
    let registration = match table.register_self() {
        Ok(r) => Some(r),
        Err(ShmemError::RegistryFull(slots)) => {
            tracing::warn!(slots, "Worker registry full, running unregistered");
            None
        }
        Err(e) => return Err(e.into()),
    };

    loop {
        if shutdown.load(Ordering::SeqCst) {
            tracing::info!("Termination requested, leaving claim loop");
            return Ok(WorkerOutcome::Aborted);
        }
        let Some(n) = table.claim_next()? else {
            tracing::info!("All integers claimed");
            return Ok(WorkerOutcome::Exhausted);
        };

        if predicate.is_target(n) {
            tracing::info!(value = n, "Found");
            if let Some(r) = &registration {
                r.record_found();
            }
            match table.report_result(n) {
                Ok(()) => {}
                Err(ShmemError::Full(full)) => tracing::warn!(error = %full, "Result not stored"),
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(r) = &registration {
            r.record_tested();
        }
    }
}
