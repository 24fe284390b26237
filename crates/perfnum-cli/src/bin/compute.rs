//! Worker: tests integers and reports perfect numbers to the coordinator.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::SinkExt;
use perfnum::bridge::codec::PacketCodec;
use perfnum::bridge::transport;
use perfnum::{
    ClaimTable, PerfectNumber, Settings, ShutdownFlag, WorkRange, WorkerOutcome, run_pipe_worker,
    run_shmem_worker, run_socket_worker,
};
use tokio_util::codec::FramedWrite;

#[derive(Parser)]
#[command(name = "compute")]
#[command(about = "Test integers for perfection")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Test [start, end] and write results to stdout (spawned by `manage pipe`)
    Pipe { start: u32, end: u32 },
    /// Claim integers from the shared claim table
    Shmem,
    /// Request ranges from a socket coordinator
    Socket {
        /// Coordinator host, PERFNUM_HOST or 127.0.0.1 when omitted
        host: Option<String>,
    },
}

fn main() -> Result<()> {
    perfnum::init_tracing();
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(run(args.mode))
}

async fn run(mode: Mode) -> Result<()> {
    let shutdown = ShutdownFlag::install().context("failed to install signal handlers")?;
    let settings = Settings::from_env();
    let predicate = Arc::new(PerfectNumber);

    let outcome = match mode {
        Mode::Pipe { start, end } => {
            let range = WorkRange::new(start, end)?;
            let mut writer = FramedWrite::new(tokio::io::stdout(), PacketCodec::new());
            let outcome = run_pipe_worker(predicate, range, &mut writer, &shutdown).await?;
            writer.flush().await.context("failed to flush results")?;
            outcome
        }
        Mode::Shmem => {
            let table = ClaimTable::attach(&settings.shm_name)
                .with_context(|| format!("no claim table at {}", settings.shm_name))?;
            run_shmem_worker(predicate, Arc::new(table), &shutdown).await?
        }
        Mode::Socket { host } => {
            let host = host.unwrap_or(settings.host);
            let (mut reader, mut writer) = transport::connect(&host, settings.port)
                .await
                .with_context(|| format!("failed to connect to {}:{}", host, settings.port))?;
            run_socket_worker(predicate, &mut reader, &mut writer, &shutdown).await?
        }
    };

    if outcome == WorkerOutcome::Aborted {
        tracing::info!("Stopped before finishing assigned work");
    }
    Ok(())
}
