//! perfnum: distributed perfect-number search over shared memory, pipes or sockets.

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod launcher;
mod logging;
pub mod monitor;
pub mod partition;
pub mod predicate;
pub mod results;
pub mod shmem;
pub mod shutdown;
pub mod worker;

pub use bridge::protocol::{PID_CLIENT, PID_SERVER, Packet, PacketTag, ProtocolError};
pub use config::Settings;
pub use coordinator::{CoordinatorError, RunOutcome};
pub use launcher::{CommandLauncher, ProcessLauncher, SpawnError};
pub use logging::init_tracing;
pub use monitor::{Monitor, MonitorError, PipeMonitor, ShmemMonitor, SocketMonitor, Summary};
pub use partition::{PartitionError, WorkRange, partition};
pub use predicate::{PerfectNumber, Predicate};
pub use results::{ResultBuffer, ResultsFull};
pub use shmem::{ClaimTable, ShmemError};
pub use shutdown::ShutdownFlag;
pub use worker::{WorkerError, WorkerOutcome, run_pipe_worker, run_shmem_worker, run_socket_worker};
