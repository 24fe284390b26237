//! Spawning and signalling worker processes.

use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("spawned process has no pid")]
    NoPid,
}

/// Extension point for how worker processes are started.
pub trait ProcessLauncher: Send + Sync {
    /// Start a worker with `args`, its stdout replaced by `stdout`.
    fn launch(&self, args: &[String], stdout: OwnedFd) -> Result<Child, SpawnError>;
}

/// Launches an external program, by default the `compute` binary.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, args: &[String], stdout: OwnedFd) -> Result<Child, SpawnError> {
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                program: self.program.display().to_string(),
                source,
            })
    }
}

/// Ask a process to terminate with SIGQUIT. A process already gone is not an error.
///
/// Pids below 1 would address process groups and are rejected.
pub fn request_termination(pid: i32) -> nix::Result<()> {
    if pid < 1 {
        return Err(Errno::EINVAL);
    }
    match kill(Pid::from_raw(pid), Signal::SIGQUIT) {
        Ok(()) => {
            tracing::debug!(pid, "Sent SIGQUIT");
            Ok(())
        }
        Err(Errno::ESRCH) => {
            tracing::debug!(pid, "Process already exited");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Human-readable account of how a child ended.
pub fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("exited with code {}", code)
    } else if let Some(sig) = status.signal() {
        match Signal::try_from(sig) {
            Ok(sig) => format!("killed by {}", sig),
            Err(_) => format!("killed by signal {}", sig),
        }
    } else {
        "unknown exit".to_string()
    }
}
