//! Runtime settings shared by the coordinator, workers and monitor.

use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_SHM_NAME: &str = "/perfnum";
pub const DEFAULT_FIFO: &str = ".perfect_numbers";
pub const DEFAULT_PID_FILE: &str = "manage.pid";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 10054;
pub const DEFAULT_BLOCK_SIZE: u32 = 1000;
pub const DEFAULT_MAX_CLIENTS: usize = 1024;
pub const COMPUTE_BIN: &str = "compute";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub shm_name: String,
    pub fifo_path: PathBuf,
    pub pid_file: PathBuf,
    pub host: String,
    pub port: u16,
    pub block_size: u32,
    pub compute_cmd: PathBuf,
    pub max_clients: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            shm_name: DEFAULT_SHM_NAME.to_string(),
            fifo_path: PathBuf::from(DEFAULT_FIFO),
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            block_size: DEFAULT_BLOCK_SIZE,
            compute_cmd: default_compute_cmd(),
            max_clients: DEFAULT_MAX_CLIENTS,
        }
    }
}

/// `compute` next to the running executable, or on `PATH` if that can't be resolved.
fn default_compute_cmd() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(COMPUTE_BIN)))
        .unwrap_or_else(|| PathBuf::from(COMPUTE_BIN))
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `PERFNUM_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();
        if let Some(v) = lookup("PERFNUM_SHM_NAME") {
            settings.shm_name = v;
        }
        if let Some(v) = lookup("PERFNUM_FIFO") {
            settings.fifo_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PERFNUM_PID_FILE") {
            settings.pid_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("PERFNUM_HOST") {
            settings.host = v;
        }
        if let Some(v) = lookup("PERFNUM_COMPUTE_CMD") {
            settings.compute_cmd = PathBuf::from(v);
        }
        if let Some(port) = parse_var(&lookup, "PERFNUM_PORT") {
            settings.port = port;
        }
        if let Some(block) = parse_var::<u32>(&lookup, "PERFNUM_BLOCK_SIZE") {
            if block == 0 {
                tracing::warn!("PERFNUM_BLOCK_SIZE must be positive, keeping default");
            } else {
                settings.block_size = block;
            }
        }
        if let Some(max) = parse_var(&lookup, "PERFNUM_MAX_CLIENTS") {
            settings.max_clients = max;
        }
        settings
    }

    pub fn with_shm_name(mut self, name: impl Into<String>) -> Self {
        self.shm_name = name.into();
        self
    }

    pub fn with_fifo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fifo_path = path.into();
        self
    }

    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = path.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_compute_cmd(mut self, cmd: impl Into<PathBuf>) -> Self {
        self.compute_cmd = cmd.into();
        self
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid setting");
            None
        }
    }
}
