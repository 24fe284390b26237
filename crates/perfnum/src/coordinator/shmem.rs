//! Shared-memory coordinator: owns the claim table while workers run.

use super::{CoordinatorError, RunOutcome};
use crate::launcher::request_termination;
use crate::shmem::ClaimTable;
use crate::shutdown::ShutdownFlag;

/// Create the claim table for `[1, limit]` and hold it until shutdown is requested.
pub async fn run(
    shm_name: &str,
    limit: u32,
    shutdown: &ShutdownFlag,
) -> Result<RunOutcome, CoordinatorError> {
    let table = ClaimTable::initialize(shm_name, limit)?;
    tracing::info!(
        name = shm_name,
        owner = table.owner_pid(),
        "Claim table ready, waiting for termination request"
    );

    shutdown.wait().await;

    let claimed = table.claimed_count();
    tracing::info!(claimed, limit, results = ?table.results(), "Shutting down claim table");
    cleanup(table)?;

    Ok(if claimed == limit {
        RunOutcome::Completed
    } else {
        RunOutcome::Interrupted
    })
}

/// Signal every still-registered worker, then destroy the region.
pub fn cleanup(table: ClaimTable) -> Result<(), CoordinatorError> {
    for worker in table.worker_snapshots() {
        tracing::info!(
            pid = worker.pid,
            tested = worker.tested,
            found = worker.found,
            "Terminating registered worker"
        );
        if let Err(e) = request_termination(worker.pid) {
            tracing::warn!(pid = worker.pid, error = %e, "Failed to signal worker");
        }
    }
    table.destroy()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{CommandLauncher, ProcessLauncher, describe_exit};
    use std::time::Duration;

    #[tokio::test]
    async fn cleanup_signals_registered_workers() {
        let name = format!("/perfnum-coord-cleanup-{}", std::process::id());
        let table = ClaimTable::initialize(&name, 100).unwrap();

        let devnull = std::fs::File::create("/dev/null").unwrap();
        let mut child = CommandLauncher::new("sleep")
            .launch(&["30".to_string()], devnull.into())
            .unwrap();
        let pid = child.id().unwrap() as i32;
        // Simulate the child having registered itself.
        std::mem::forget(table.register(pid).unwrap());

        cleanup(table).unwrap();

        let status = child.wait().await.unwrap();
        assert_eq!(describe_exit(status), "killed by SIGQUIT");
        assert!(ClaimTable::attach(&name).is_err());
    }

    #[tokio::test]
    async fn run_holds_table_until_shutdown() {
        let name = format!("/perfnum-coord-run-{}", std::process::id());
        let shutdown = ShutdownFlag::new();

        let coordinator = {
            let (name, shutdown) = (name.clone(), shutdown.clone());
            tokio::spawn(async move { run(&name, 50, &shutdown).await })
        };

        let table = loop {
            match ClaimTable::attach(&name) {
                Ok(t) => break t,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        assert_eq!(table.limit(), 50);
        while table.claim_next().unwrap().is_some() {}
        drop(table);

        shutdown.request();
        assert_eq!(coordinator.await.unwrap().unwrap(), RunOutcome::Completed);
        assert!(ClaimTable::attach(&name).is_err());
    }
}
