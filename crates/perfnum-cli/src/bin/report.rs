//! Monitor: prints results as the coordinator reports them.

use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use perfnum::{Monitor, PipeMonitor, Settings, ShmemMonitor, ShutdownFlag, SocketMonitor};

#[derive(Parser)]
#[command(name = "report")]
#[command(about = "Report perfect numbers found so far")]
#[command(version)]
struct Args {
    /// Ask the coordinator to shut down
    #[arg(short, long)]
    kill: bool,

    /// Print the final summary as JSON instead of one value per line
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Read the shared claim table
    Shmem,
    /// Read the coordinator's FIFO
    Pipe,
    /// Subscribe to a socket coordinator
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

    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let shutdown = ShutdownFlag::install().context("failed to install signal handlers")?;
    let settings = Settings::from_env();

    // A shared-memory report is a snapshot, so it is still printed before a kill.
    let snapshot_first = matches!(args.mode, Mode::Shmem);
    let mut monitor: Box<dyn Monitor> = match args.mode {
        Mode::Shmem => Box::new(ShmemMonitor::new(settings.shm_name)),
        Mode::Pipe => Box::new(PipeMonitor::new(settings.fifo_path, settings.pid_file)),
        Mode::Socket { host } => Box::new(SocketMonitor::new(
            host.unwrap_or(settings.host),
            settings.port,
        )),
    };

    if args.kill && !snapshot_first {
        monitor.kill().await.context("failed to stop coordinator")?;
        return Ok(());
    }

    let summary = if args.json {
        monitor.report(&mut io::sink(), &shutdown).await?
    } else {
        monitor.report(&mut io::stdout(), &shutdown).await?
    };

    if args.json {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", summary.to_json()?)?;
    }
    if summary.missed_work {
        tracing::warn!("Some integers were never tested");
    }

    if args.kill {
        monitor.kill().await.context("failed to stop coordinator")?;
    }
    Ok(())
}
