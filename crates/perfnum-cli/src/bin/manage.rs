//! Coordinator: owns the claim table, or spawns and feeds workers.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use perfnum::coordinator::{pipe, shmem, socket};
use perfnum::{CommandLauncher, RunOutcome, Settings, ShutdownFlag};

#[derive(Parser)]
#[command(name = "manage")]
#[command(about = "Coordinate a perfect number search")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Create the shared claim table and hold it until terminated
    Shmem {
        /// Search [1, limit]
        limit: u32,
    },
    /// Split [1, limit] across nprocs workers sharing one pipe
    Pipe {
        /// Search [1, limit]
        limit: u32,
        /// Number of worker processes to spawn
        nprocs: u32,
    },
    /// Serve ranges of [1, limit] to workers connecting over TCP
    Socket {
        /// Search [1, limit]
        limit: u32,
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
    tracing::debug!(?settings, "Loaded settings");

    let outcome = match mode {
        Mode::Shmem { limit } => shmem::run(&settings.shm_name, limit, &shutdown)
            .await
            .with_context(|| format!("shared-memory coordinator on {}", settings.shm_name))?,
        Mode::Pipe { limit, nprocs } => {
            let launcher = Arc::new(CommandLauncher::new(settings.compute_cmd.clone()));
            pipe::run(limit, nprocs, &settings, launcher, &shutdown)
                .await
                .context("pipe coordinator")?
        }
        Mode::Socket { limit } => {
            let listener = socket::bind(settings.port).await?;
            socket::serve(
                listener,
                limit,
                settings.block_size,
                settings.max_clients,
                &shutdown,
            )
            .await
            .context("socket coordinator")?
        }
    };

    match outcome {
        RunOutcome::Completed => tracing::info!("Search complete"),
        RunOutcome::Interrupted => tracing::warn!("Search interrupted before completion"),
    }
    Ok(())
}
