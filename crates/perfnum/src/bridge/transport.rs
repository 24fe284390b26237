//! Transport plumbing for the three coordination modes.
//!
//! - **Shared pipe**: one anonymous pipe whose write end becomes every pipe
//!   worker's stdout; the coordinator reads the other end.
//! - **FIFO**: named pipe from coordinator to monitor, plus the PID file the
//!   monitor uses to find the coordinator.
//! - **TCP**: framed halves of a socket, used by socket workers and monitor.

use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::stat::Mode;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::PacketCodec;
use crate::shutdown::ShutdownFlag;

pub type PacketReader<R> = FramedRead<R, PacketCodec>;
pub type PacketWriter<W> = FramedWrite<W, PacketCodec>;

/// How often rendezvous loops re-check for the peer while waiting.
const RENDEZVOUS_POLL: Duration = Duration::from_millis(100);

/// True for errors that mean the other end went away.
pub fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

/// Shared pipe between pipe workers and the coordinator.
///
/// The write end is handed to each child as stdout (see [`SharedPipe::worker_stdout`]);
/// it must be dropped once every child is spawned so the reader sees EOF when the
/// last worker exits.
pub struct SharedPipe {
    pub reader: PacketReader<pipe::Receiver>,
    write_end: Option<OwnedFd>,
}

impl SharedPipe {
    pub fn create() -> io::Result<Self> {
        let (read_end, write_end) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .map_err(|e| io::Error::other(format!("pipe failed: {}", e)))?;

        // from_owned_fd switches the read end to non-blocking.
        let receiver = pipe::Receiver::from_owned_fd(read_end)?;
        tracing::debug!("Created shared worker pipe");

        Ok(Self {
            reader: FramedRead::new(receiver, PacketCodec::new()),
            write_end: Some(write_end),
        })
    }

    /// A duplicate of the write end, suitable for a child's stdout.
    pub fn worker_stdout(&self) -> io::Result<OwnedFd> {
        match &self.write_end {
            Some(fd) => fd.try_clone(),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "shared pipe write end already closed",
            )),
        }
    }

    /// Drop the coordinator's own copy of the write end.
    pub fn close_write_end(&mut self) {
        self.write_end = None;
    }
}

/// Create the report FIFO, replacing a stale one left by a previous run.
pub fn create_fifo(path: &Path) -> io::Result<()> {
    if path.exists() {
        tracing::debug!(path = %path.display(), "Removing stale FIFO");
        std::fs::remove_file(path)?;
    }
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|e| io::Error::other(format!("mkfifo {} failed: {}", path.display(), e)))?;
    tracing::debug!(path = %path.display(), "Created FIFO");
    Ok(())
}

/// Open the write side of the FIFO once a monitor has opened the read side.
///
/// Returns `Ok(None)` if shutdown was requested while waiting.
pub async fn open_fifo_sender(
    path: &Path,
    shutdown: &ShutdownFlag,
) -> io::Result<Option<PacketWriter<pipe::Sender>>> {
    let mut waiting_logged = false;
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => {
                tracing::debug!(path = %path.display(), "Monitor attached to FIFO");
                return Ok(Some(FramedWrite::new(sender, PacketCodec::new())));
            }
            Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {
                if !waiting_logged {
                    tracing::info!(path = %path.display(), "Waiting for a monitor to open the FIFO");
                    waiting_logged = true;
                }
            }
            Err(e) => return Err(e),
        }

        tokio::select! {
            _ = shutdown.wait() => return Ok(None),
            _ = tokio::time::sleep(RENDEZVOUS_POLL) => {}
        }
    }
}

/// Open the read side of the FIFO and wait for the coordinator to attach.
///
/// The open is a plain blocking read-only open: it registers this process as
/// a reader, which is what lets [`open_fifo_sender`] succeed, and returns once
/// the coordinator holds the write side. No write handle is kept here, so the
/// stream ends when the coordinator goes away.
///
/// Returns `Ok(None)` if shutdown was requested while waiting.
pub async fn open_fifo_receiver(
    path: &Path,
    shutdown: &ShutdownFlag,
) -> io::Result<Option<PacketReader<pipe::Receiver>>> {
    while !path.exists() {
        tokio::select! {
            _ = shutdown.wait() => return Ok(None),
            _ = tokio::time::sleep(RENDEZVOUS_POLL) => {}
        }
    }

    let mut open = {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || File::open(path))
    };
    let file = tokio::select! {
        opened = &mut open => opened.map_err(io::Error::other)??,
        _ = shutdown.wait() => {
            release_blocked_open(path, open).await;
            return Ok(None);
        }
    };

    let receiver = pipe::Receiver::from_file(file)?;
    tracing::debug!(path = %path.display(), "Coordinator attached to FIFO");
    Ok(Some(FramedRead::new(receiver, PacketCodec::new())))
}

/// Briefly attach a writer so a pending blocking open returns and its thread exits.
async fn release_blocked_open(path: &Path, open: JoinHandle<io::Result<File>>) {
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(_writer) => {
                let _ = open.await;
                return;
            }
            // The blocking open has not registered as a reader yet.
            Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) && !open.is_finished() => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Could not release FIFO open");
                return;
            }
        }
    }
}

pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    std::fs::write(path, pid.to_string())?;
    tracing::debug!(path = %path.display(), pid, "Wrote PID file");
    Ok(())
}

pub fn read_pid_file(path: &Path) -> io::Result<i32> {
    let contents = std::fs::read_to_string(path)?;
    contents.trim().parse::<i32>().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid PID file {}: {}", path.display(), e),
        )
    })
}

/// Remove a rendezvous file, ignoring it if already gone.
pub fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}

/// Connect to the coordinator and split the socket into framed halves.
pub async fn connect(
    host: &str,
    port: u16,
) -> io::Result<(PacketReader<OwnedReadHalf>, PacketWriter<OwnedWriteHalf>)> {
    tracing::debug!(host, port, "Connecting to coordinator");
    let stream = TcpStream::connect((host, port)).await?;
    Ok(split(stream))
}

pub fn split(stream: TcpStream) -> (PacketReader<OwnedReadHalf>, PacketWriter<OwnedWriteHalf>) {
    let (read_half, write_half) = stream.into_split();
    (
        FramedRead::new(read_half, PacketCodec::new()),
        FramedWrite::new(write_half, PacketCodec::new()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Packet;
    use futures::{SinkExt, StreamExt};

    #[test]
    fn pid_file_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manage.pid");

        write_pid_file(&path, 31337).unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), 31337);

        remove_if_present(&path);
        assert!(!path.exists());
        // Second removal is a no-op.
        remove_if_present(&path);
    }

    #[test]
    fn garbage_pid_file_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manage.pid");
        std::fs::write(&path, "not-a-pid").unwrap();

        let err = read_pid_file(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn peer_closed_classification() {
        assert!(is_peer_closed(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_peer_closed(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_peer_closed(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn fifo_carries_packets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.fifo");
        let shutdown = ShutdownFlag::new();

        create_fifo(&path).unwrap();
        let (reader, writer) = tokio::join!(
            open_fifo_receiver(&path, &shutdown),
            open_fifo_sender(&path, &shutdown)
        );
        let mut reader = reader.unwrap().unwrap();
        let mut writer = writer.unwrap().unwrap();

        writer.send(Packet::PerfNum { value: 28 }).await.unwrap();
        writer.send(Packet::Done { pid: 5 }).await.unwrap();

        assert_eq!(reader.next().await.unwrap().unwrap(), Ok(Packet::PerfNum { value: 28 }));
        assert_eq!(reader.next().await.unwrap().unwrap(), Ok(Packet::Done { pid: 5 }));
    }

    #[tokio::test]
    async fn fifo_reader_ends_when_sender_goes_away() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.fifo");
        let shutdown = ShutdownFlag::new();

        create_fifo(&path).unwrap();
        let (reader, writer) = tokio::join!(
            open_fifo_receiver(&path, &shutdown),
            open_fifo_sender(&path, &shutdown)
        );
        let mut reader = reader.unwrap().unwrap();
        let mut writer = writer.unwrap().unwrap();

        writer.send(Packet::PerfNum { value: 6 }).await.unwrap();
        drop(writer);

        let wait = Duration::from_secs(2);
        let first = tokio::time::timeout(wait, reader.next()).await.unwrap();
        assert_eq!(first.unwrap().unwrap(), Ok(Packet::PerfNum { value: 6 }));
        let end = tokio::time::timeout(wait, reader.next()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn fifo_reader_ends_when_sender_closes_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.fifo");
        let shutdown = ShutdownFlag::new();

        create_fifo(&path).unwrap();
        let (reader, writer) = tokio::join!(
            open_fifo_receiver(&path, &shutdown),
            open_fifo_sender(&path, &shutdown)
        );
        let mut reader = reader.unwrap().unwrap();
        drop(writer);

        let end = tokio::time::timeout(Duration::from_secs(2), reader.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn receiver_wait_is_cancelled_by_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.fifo");
        let shutdown = ShutdownFlag::new();
        create_fifo(&path).unwrap();

        let receiver = {
            let (path, shutdown) = (path.clone(), shutdown.clone());
            tokio::spawn(async move { open_fifo_receiver(&path, &shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.request();

        let opened = tokio::time::timeout(Duration::from_secs(2), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(opened.is_none());
    }

    #[tokio::test]
    async fn sender_wait_is_cancelled_by_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.fifo");
        let shutdown = ShutdownFlag::new();
        create_fifo(&path).unwrap();

        shutdown.request();
        let opened = open_fifo_sender(&path, &shutdown).await.unwrap();
        assert!(opened.is_none());
    }

    #[tokio::test]
    async fn shared_pipe_reads_what_children_write() {
        let mut shared = SharedPipe::create().unwrap();
        let stdout = shared.worker_stdout().unwrap();
        shared.close_write_end();

        let mut writer = FramedWrite::new(
            pipe::Sender::from_owned_fd(stdout).unwrap(),
            PacketCodec::new(),
        );
        writer.send(Packet::PerfNum { value: 6 }).await.unwrap();
        drop(writer);

        assert_eq!(
            shared.reader.next().await.unwrap().unwrap(),
            Ok(Packet::PerfNum { value: 6 })
        );
        assert!(shared.reader.next().await.is_none());
    }
}
