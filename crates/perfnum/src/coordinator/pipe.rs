//! Pipe coordinator: static partitioning, one shared pipe, FIFO to the monitor.
//!
//! Flow:
//! 1. Partition `[1, limit]` and write the PID file
//! 2. Create the FIFO, spawn workers with stdout on the shared pipe
//! 3. Wait for a monitor to open the FIFO
//! 4. Dispatch packets until every worker reported or shutdown is requested
//! 5. Tell the monitor how it ended, remove FIFO and PID file, reap stragglers

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::process::Child;

use super::{CoordinatorError, RunOutcome};
use crate::bridge::protocol::{Packet, ProtocolError};
use crate::bridge::transport::{self, SharedPipe};
use crate::config::Settings;
use crate::launcher::{ProcessLauncher, SpawnError, describe_exit, request_termination};
use crate::partition::{WorkRange, partition};
use crate::results::ResultBuffer;
use crate::shutdown::ShutdownFlag;

/// Packet routing between the shared worker pipe and the monitor.
pub struct Dispatcher<S> {
    children: HashMap<i32, Child>,
    expected: usize,
    finished: usize,
    results: ResultBuffer,
    sink: Option<S>,
}

impl<S> Dispatcher<S>
where
    S: Sink<Packet, Error = io::Error> + Unpin,
{
    pub fn new(children: HashMap<i32, Child>, sink: Option<S>) -> Self {
        let expected = children.len();
        Self {
            children,
            expected,
            finished: 0,
            results: ResultBuffer::new(),
            sink,
        }
    }

    pub fn results(&self) -> &[u32] {
        self.results.as_slice()
    }

    pub fn finished(&self) -> usize {
        self.finished
    }

    pub fn set_sink(&mut self, sink: S) {
        self.sink = Some(sink);
    }

    /// Read packets until every worker is accounted for, the pipe closes, or
    /// shutdown is requested.
    pub async fn run<R>(
        &mut self,
        reader: &mut R,
        shutdown: &ShutdownFlag,
    ) -> Result<RunOutcome, CoordinatorError>
    where
        R: Stream<Item = io::Result<Result<Packet, ProtocolError>>> + Unpin,
    {
        while self.finished < self.expected {
            let frame = tokio::select! {
                _ = shutdown.wait() => {
                    tracing::info!(finished = self.finished, "Dispatch interrupted");
                    return Ok(RunOutcome::Interrupted);
                }
                frame = reader.next() => frame,
            };

            match frame {
                None => {
                    tracing::warn!(
                        finished = self.finished,
                        expected = self.expected,
                        "Worker pipe closed before every worker reported"
                    );
                    return Ok(RunOutcome::Interrupted);
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Err(e))) => tracing::warn!(error = %e, "Protocol violation on worker pipe"),
                Some(Ok(Ok(packet))) => self.handle(packet).await,
            }
        }
        tracing::info!(workers = self.finished, "All workers finished");
        Ok(RunOutcome::Completed)
    }

    async fn handle(&mut self, packet: Packet) {
        match packet {
            Packet::PerfNum { value } => {
                tracing::info!(value, "Result received");
                if let Err(full) = self.results.push(value) {
                    tracing::warn!(error = %full, "Result not buffered");
                }
                self.forward(packet).await;
            }
            Packet::Closed { pid } => {
                tracing::warn!(pid, "Worker stopped before finishing its range");
                self.forward(packet).await;
                self.reap(pid).await;
            }
            Packet::Done { pid } => self.reap(pid).await,
            other => {
                tracing::warn!(error = %other.unexpected(), "Protocol violation on worker pipe")
            }
        }
    }

    async fn reap(&mut self, pid: i32) {
        let Some(mut child) = self.children.remove(&pid) else {
            tracing::warn!(pid, "Report from unknown worker");
            return;
        };
        match child.wait().await {
            Ok(status) => tracing::debug!(pid, status = %describe_exit(status), "Reaped worker"),
            Err(e) => tracing::warn!(pid, error = %e, "Failed to reap worker"),
        }
        self.finished += 1;
    }

    /// Send to the monitor. A monitor that went away is dropped, not fatal.
    async fn forward(&mut self, packet: Packet) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if let Err(e) = sink.send(packet).await {
            if transport::is_peer_closed(&e) {
                tracing::warn!("Monitor went away, continuing without it");
            } else {
                tracing::warn!(error = %e, "Failed to forward to monitor");
            }
            self.sink = None;
        }
    }

    /// Tell the monitor how the run ended and terminate any remaining workers.
    pub async fn finish(&mut self, outcome: RunOutcome) {
        let pid = std::process::id() as i32;
        let last = match outcome {
            RunOutcome::Completed => Packet::Done { pid },
            RunOutcome::Interrupted => Packet::Closed { pid },
        };
        self.forward(last).await;

        for (pid, mut child) in self.children.drain() {
            tracing::info!(pid, "Terminating unaccounted worker");
            if let Err(e) = request_termination(pid) {
                tracing::warn!(pid, error = %e, "Failed to signal worker");
            }
            match child.wait().await {
                Ok(status) => tracing::debug!(pid, status = %describe_exit(status), "Reaped worker"),
                Err(e) => tracing::warn!(pid, error = %e, "Failed to reap worker"),
            }
        }
    }
}

/// Run the pipe coordinator for `[1, limit]` across `nprocs` workers.
pub async fn run(
    limit: u32,
    nprocs: u32,
    settings: &Settings,
    launcher: Arc<dyn ProcessLauncher>,
    shutdown: &ShutdownFlag,
) -> Result<RunOutcome, CoordinatorError> {
    let ranges = partition(limit, nprocs)?;

    transport::write_pid_file(&settings.pid_file, std::process::id())?;
    let result = run_inner(&ranges, settings, launcher, shutdown).await;

    transport::remove_if_present(&settings.fifo_path);
    transport::remove_if_present(&settings.pid_file);
    result
}

fn spawn_worker(
    shared: &SharedPipe,
    launcher: &dyn ProcessLauncher,
    range: &WorkRange,
) -> Result<(i32, Child), CoordinatorError> {
    let args = [
        "pipe".to_string(),
        range.start().to_string(),
        range.end().to_string(),
    ];
    let child = launcher.launch(&args, shared.worker_stdout()?)?;
    let pid = child.id().ok_or(SpawnError::NoPid)?;
    Ok((pid as i32, child))
}

async fn run_inner(
    ranges: &[WorkRange],
    settings: &Settings,
    launcher: Arc<dyn ProcessLauncher>,
    shutdown: &ShutdownFlag,
) -> Result<RunOutcome, CoordinatorError> {
    transport::create_fifo(&settings.fifo_path)?;
    let mut shared = SharedPipe::create()?;

    let mut children = HashMap::with_capacity(ranges.len());
    let mut spawn_error = None;
    for range in ranges {
        match spawn_worker(&shared, launcher.as_ref(), range) {
            Ok((pid, child)) => {
                tracing::info!(pid, start = range.start(), end = range.end(), "Spawned worker");
                children.insert(pid, child);
            }
            Err(e) => {
                spawn_error = Some(e);
                break;
            }
        }
    }
    shared.close_write_end();

    let mut dispatcher = Dispatcher::new(children, None);
    if let Some(e) = spawn_error {
        tracing::error!(error = %e, "Worker spawn failed");
        dispatcher.finish(RunOutcome::Interrupted).await;
        return Err(e);
    }

    let Some(sink) = transport::open_fifo_sender(&settings.fifo_path, shutdown).await? else {
        dispatcher.finish(RunOutcome::Interrupted).await;
        return Ok(RunOutcome::Interrupted);
    };
    dispatcher.set_sink(sink);

    let outcome = match dispatcher.run(&mut shared.reader, shutdown).await {
        Ok(outcome) => outcome,
        Err(e) => {
            dispatcher.finish(RunOutcome::Interrupted).await;
            return Err(e);
        }
    };
    dispatcher.finish(outcome).await;

    tracing::info!(?outcome, results = ?dispatcher.results(), "Pipe coordinator finished");
    Ok(outcome)
}
