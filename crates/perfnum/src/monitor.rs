//! Result monitor for all three transports.
//!
//! A [`Monitor`] either drains results as the coordinator relays them, or asks
//! the coordinator to shut down. Pipe and socket monitors stream; the
//! shared-memory monitor reads a snapshot of the claim table.

use std::io::{self, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use serde::Serialize;

use crate::bridge::protocol::{PID_SERVER, Packet, ProtocolError};
use crate::bridge::transport;
use crate::launcher::request_termination;
use crate::shmem::{ClaimTable, ShmemError, WorkerSnapshot};
use crate::shutdown::ShutdownFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Shmem,
    Pipe,
    Socket,
}

/// How a report ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// The coordinator announced completion.
    Finished,
    /// The coordinator shut down before finishing.
    CoordinatorClosed,
    /// The channel closed without a final packet.
    Disconnected,
    /// This monitor was asked to stop.
    Interrupted,
    /// Point-in-time view of shared memory.
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub transport: Transport,
    pub status: ReportStatus,
    pub results: Vec<u32>,
    /// Some worker stopped before finishing its work.
    pub missed_work: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub workers: Vec<WorkerSnapshot>,
}

impl Summary {
    fn new(transport: Transport, status: ReportStatus) -> Self {
        Self {
            transport,
            status,
            results: Vec::new(),
            missed_work: false,
            limit: None,
            claimed: None,
            workers: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String, MonitorError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Shmem(#[from] ShmemError),
    #[error("another monitor is already subscribed")]
    Refused,
    #[error("unexpected reply to notify: {0}")]
    UnexpectedReply(Packet),
    #[error("failed to signal coordinator {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::errno::Errno,
    },
    #[error("failed to encode summary: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait Monitor: Send {
    /// Collect results, writing each one to `out` as it arrives.
    async fn report(
        &mut self,
        out: &mut (dyn Write + Send),
        shutdown: &ShutdownFlag,
    ) -> Result<Summary, MonitorError>;

    /// Ask the coordinator to shut down.
    async fn kill(&mut self) -> Result<(), MonitorError>;
}

/// Read packets until the coordinator finishes, goes away, or shutdown is requested.
///
/// `coordinator_pid` identifies a `Closed` from the coordinator itself; any
/// other `Closed` means a worker quit early and is only a warning.
async fn drain<R>(
    reader: &mut R,
    kind: Transport,
    coordinator_pid: Option<i32>,
    out: &mut (dyn Write + Send),
    shutdown: &ShutdownFlag,
) -> Result<Summary, MonitorError>
where
    R: Stream<Item = io::Result<Result<Packet, ProtocolError>>> + Unpin + Send,
{
    let mut summary = Summary::new(kind, ReportStatus::Disconnected);

    loop {
        let frame = tokio::select! {
            _ = shutdown.wait() => {
                summary.status = ReportStatus::Interrupted;
                break;
            }
            frame = reader.next() => frame,
        };

        let packet = match frame {
            None => {
                tracing::warn!("Coordinator channel closed without a final report");
                break;
            }
            Some(Err(e)) if transport::is_peer_closed(&e) => {
                tracing::warn!(error = %e, "Coordinator connection lost");
                break;
            }
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Err(e))) => {
                tracing::warn!(error = %e, "Dropping invalid packet");
                continue;
            }
            Some(Ok(Ok(packet))) => packet,
        };

        match packet {
            Packet::PerfNum { value } => {
                if !summary.results.contains(&value) {
                    summary.results.push(value);
                }
                writeln!(out, "{}", value)?;
                out.flush()?;
            }
            Packet::Done { .. } => {
                summary.status = ReportStatus::Finished;
                break;
            }
            Packet::Closed { pid } if Some(pid) == coordinator_pid => {
                tracing::warn!(pid, "Coordinator shut down early");
                summary.status = ReportStatus::CoordinatorClosed;
                break;
            }
            Packet::Closed { pid } => {
                tracing::warn!(pid, "A worker stopped early, some integers were not tested");
                summary.missed_work = true;
            }
            other => tracing::warn!(error = %other.unexpected(), "Protocol violation"),
        }
    }

    tracing::info!(status = ?summary.status, results = ?summary.results, "Report finished");
    Ok(summary)
}

fn signal_coordinator(pid: i32) -> Result<(), MonitorError> {
    tracing::info!(pid, "Requesting coordinator shutdown");
    request_termination(pid).map_err(|source| MonitorError::Signal { pid, source })
}

/// Reads the FIFO written by the pipe coordinator.
#[derive(Debug, Clone)]
pub struct PipeMonitor {
    fifo_path: PathBuf,
    pid_file: PathBuf,
}

impl PipeMonitor {
    pub fn new(fifo_path: impl Into<PathBuf>, pid_file: impl Into<PathBuf>) -> Self {
        Self {
            fifo_path: fifo_path.into(),
            pid_file: pid_file.into(),
        }
    }
}

#[async_trait]
impl Monitor for PipeMonitor {
    async fn report(
        &mut self,
        out: &mut (dyn Write + Send),
        shutdown: &ShutdownFlag,
    ) -> Result<Summary, MonitorError> {
        let Some(mut reader) = transport::open_fifo_receiver(&self.fifo_path, shutdown).await?
        else {
            return Ok(Summary::new(Transport::Pipe, ReportStatus::Interrupted));
        };

        // The coordinator writes its PID file before creating the FIFO.
        let coordinator = match transport::read_pid_file(&self.pid_file) {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(path = %self.pid_file.display(), error = %e, "Coordinator pid unknown");
                None
            }
        };

        drain(&mut reader, Transport::Pipe, coordinator, out, shutdown).await
    }

    async fn kill(&mut self) -> Result<(), MonitorError> {
        let pid = transport::read_pid_file(&self.pid_file)?;
        signal_coordinator(pid)
    }
}

/// Subscribes to the socket coordinator's live result stream.
#[derive(Debug, Clone)]
pub struct SocketMonitor {
    host: String,
    port: u16,
}

impl SocketMonitor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Monitor for SocketMonitor {
    async fn report(
        &mut self,
        out: &mut (dyn Write + Send),
        shutdown: &ShutdownFlag,
    ) -> Result<Summary, MonitorError> {
        // Both halves stay alive until the drain ends; dropping the writer
        // would look like a disconnect to the coordinator.
        let (mut reader, mut writer) = transport::connect(&self.host, self.port).await?;
        writer.send(Packet::Notify).await?;

        loop {
            match reader.next().await {
                Some(Ok(Ok(Packet::Accept))) => break,
                Some(Ok(Ok(Packet::Refuse))) => return Err(MonitorError::Refused),
                Some(Ok(Ok(Packet::Closed { pid: PID_SERVER }))) => {
                    let status = ReportStatus::CoordinatorClosed;
                    return Ok(Summary::new(Transport::Socket, status));
                }
                Some(Ok(Ok(other))) => return Err(MonitorError::UnexpectedReply(other)),
                Some(Ok(Err(e))) => tracing::warn!(error = %e, "Dropping invalid packet"),
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(Summary::new(Transport::Socket, ReportStatus::Disconnected)),
            }
        }
        tracing::info!(host = %self.host, port = self.port, "Subscribed to results");

        let summary = drain(&mut reader, Transport::Socket, Some(PID_SERVER), out, shutdown).await;
        drop(writer);
        summary
    }

    async fn kill(&mut self) -> Result<(), MonitorError> {
        let (_reader, mut writer) = transport::connect(&self.host, self.port).await?;
        writer.send(Packet::Kill).await?;
        tracing::info!(host = %self.host, port = self.port, "Sent kill request");
        Ok(())
    }
}

/// Reads the shared claim table.
#[derive(Debug, Clone)]
pub struct ShmemMonitor {
    shm_name: String,
}

impl ShmemMonitor {
    pub fn new(shm_name: impl Into<String>) -> Self {
        Self {
            shm_name: shm_name.into(),
        }
    }

    fn snapshot(&self, out: &mut (dyn Write + Send)) -> Result<Summary, MonitorError> {
        let table = ClaimTable::attach(&self.shm_name)?;
        let mut summary = Summary::new(Transport::Shmem, ReportStatus::Snapshot);
        summary.results = table.results();
        summary.limit = Some(table.limit());
        summary.claimed = Some(table.claimed_count());
        summary.workers = table.worker_snapshots();

        for value in &summary.results {
            writeln!(out, "{}", value)?;
        }
        writeln!(out, "claimed {} of {}", table.claimed_count(), table.limit())?;
        for worker in &summary.workers {
            writeln!(
                out,
                "worker {}: tested {}, found {}",
                worker.pid, worker.tested, worker.found
            )?;
        }
        if summary.claimed == summary.limit {
            summary.status = ReportStatus::Finished;
        }
        Ok(summary)
    }
}

#[async_trait]
impl Monitor for ShmemMonitor {
    async fn report(
        &mut self,
        out: &mut (dyn Write + Send),
        _shutdown: &ShutdownFlag,
    ) -> Result<Summary, MonitorError> {
        self.snapshot(out)
    }

    async fn kill(&mut self) -> Result<(), MonitorError> {
        let table = ClaimTable::attach(&self.shm_name)?;
        signal_coordinator(table.owner_pid())
    }
}
