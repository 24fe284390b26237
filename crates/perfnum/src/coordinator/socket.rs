//! Socket coordinator: on-demand range assignment over TCP.
//!
//! Workers pull blocks by sending `Done`; at most one monitor subscribes with
//! `Notify` and receives every result live, plus a replay of what it missed.
//!
//! [`SocketState`] holds all protocol decisions and is free of I/O. [`serve`]
//! owns the listener and connections: one reader task per connection feeds an
//! mpsc channel, and a single loop selects over accepts, connection events and
//! shutdown.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{CoordinatorError, RunOutcome};
use crate::bridge::protocol::{PID_CLIENT, PID_SERVER, Packet, ProtocolError};
use crate::bridge::transport::{self, PacketReader, PacketWriter};
use crate::results::ResultBuffer;
use crate::shutdown::ShutdownFlag;

pub type ConnId = u64;

/// Work for the I/O loop produced by [`SocketState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Send { conn: ConnId, packet: Packet },
    Stop,
}

/// Protocol state of the socket coordinator.
#[derive(Debug)]
pub struct SocketState {
    limit: u32,
    block: u32,
    /// Upper bound of integers handed out so far.
    highest_assigned: u64,
    /// Every integer has been handed out.
    exhausted: bool,
    missed_some: bool,
    /// Range each worker is currently testing.
    outstanding: HashMap<ConnId, (u32, u32)>,
    results: ResultBuffer,
    notify: Option<ConnId>,
}

impl SocketState {
    pub fn new(limit: u32, block: u32) -> Self {
        Self {
            limit,
            block: block.max(1),
            highest_assigned: 0,
            exhausted: false,
            missed_some: false,
            outstanding: HashMap::new(),
            results: ResultBuffer::new(),
            notify: None,
        }
    }

    pub fn results(&self) -> &[u32] {
        self.results.as_slice()
    }

    pub fn notify_client(&self) -> Option<ConnId> {
        self.notify
    }

    pub fn missed_some(&self) -> bool {
        self.missed_some
    }

    /// Every integer has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// All integers handed out and no worker still testing one.
    pub fn is_finished(&self) -> bool {
        self.exhausted && self.outstanding.is_empty()
    }

    pub fn handle_packet(&mut self, conn: ConnId, packet: Packet) -> Vec<Action> {
        let mut actions = Vec::new();
        match packet {
            Packet::Done { .. } => {
                self.outstanding.remove(&conn);
                match self.next_range() {
                    Some((start, end)) => {
                        tracing::debug!(conn, start, end, "Assigning range");
                        self.outstanding.insert(conn, (start, end));
                        actions.push(Action::Send {
                            conn,
                            packet: Packet::Range { start, end },
                        });
                    }
                    None => {
                        actions.push(Action::Send {
                            conn,
                            packet: Packet::Refuse,
                        });
                        self.to_subscriber(Packet::Done { pid: PID_SERVER }, &mut actions);
                    }
                }
            }
            Packet::PerfNum { value } => {
                tracing::info!(conn, value, "Result received");
                if let Err(full) = self.results.push(value) {
                    tracing::warn!(error = %full, "Result not buffered");
                }
                self.to_subscriber(packet, &mut actions);
            }
            Packet::Closed { pid } => {
                if let Some((start, end)) = self.outstanding.remove(&conn) {
                    tracing::warn!(conn, pid, start, end, "Worker quit mid-range, range left untested");
                }
                self.missed_some = true;
                self.to_subscriber(packet, &mut actions);
            }
            Packet::Notify => {
                if self.notify.is_some() {
                    tracing::info!(conn, "Refusing second subscriber");
                    actions.push(Action::Send {
                        conn,
                        packet: Packet::Refuse,
                    });
                } else {
                    tracing::info!(conn, "Monitor subscribed");
                    self.notify = Some(conn);
                    self.replay(conn, &mut actions);
                }
            }
            Packet::Kill => {
                tracing::info!(conn, "Kill requested");
                actions.push(Action::Stop);
            }
            other => {
                tracing::warn!(conn, error = %other.unexpected(), "Protocol violation");
            }
        }
        actions
    }

    /// Forget a connection. A worker that held a range is counted as missed work.
    pub fn disconnected(&mut self, conn: ConnId) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.notify == Some(conn) {
            tracing::info!(conn, "Monitor unsubscribed");
            self.notify = None;
        }
        if let Some((start, end)) = self.outstanding.remove(&conn) {
            tracing::warn!(conn, start, end, "Worker disconnected mid-range, range left untested");
            self.missed_some = true;
            self.to_subscriber(Packet::Closed { pid: PID_CLIENT }, &mut actions);
        }
        actions
    }

    fn next_range(&mut self) -> Option<(u32, u32)> {
        let limit = u64::from(self.limit);
        if self.highest_assigned >= limit {
            if !self.exhausted {
                tracing::info!(limit, results = ?self.results.as_slice(), "All integers handed out");
            }
            self.exhausted = true;
            return None;
        }
        let start = self.highest_assigned + 1;
        let end = (self.highest_assigned + u64::from(self.block)).min(limit);
        self.highest_assigned += u64::from(self.block);
        // Both bounds are <= limit, which fits in u32.
        Some((start as u32, end as u32))
    }

    fn replay(&self, conn: ConnId, actions: &mut Vec<Action>) {
        let mut send = |packet| actions.push(Action::Send { conn, packet });
        send(Packet::Accept);
        if self.missed_some {
            send(Packet::Closed { pid: PID_CLIENT });
        }
        for &value in self.results.as_slice() {
            send(Packet::PerfNum { value });
        }
        if self.exhausted {
            send(Packet::Done { pid: PID_SERVER });
        }
    }

    fn to_subscriber(&self, packet: Packet, actions: &mut Vec<Action>) {
        if let Some(conn) = self.notify {
            actions.push(Action::Send { conn, packet });
        }
    }
}

#[derive(Debug)]
enum ConnEvent {
    Frame(Result<Packet, ProtocolError>),
    Closed,
    Error(io::Error),
}

fn spawn_reader(
    conn: ConnId,
    mut reader: PacketReader<OwnedReadHalf>,
    tx: mpsc::Sender<(ConnId, ConnEvent)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match reader.next().await {
                Some(Ok(frame)) => {
                    if tx.send((conn, ConnEvent::Frame(frame))).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send((conn, ConnEvent::Error(e))).await;
                    break;
                }
                None => {
                    let _ = tx.send((conn, ConnEvent::Closed)).await;
                    break;
                }
            }
        }
        tracing::trace!(conn, "Connection reader exiting");
    })
}

struct Connection {
    writer: PacketWriter<OwnedWriteHalf>,
    reader_task: JoinHandle<()>,
}

/// Bind the coordinator's listening socket on all interfaces.
pub async fn bind(port: u16) -> Result<TcpListener, CoordinatorError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| CoordinatorError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    tracing::info!(addr = %listener.local_addr()?, "Listening");
    Ok(listener)
}

/// Serve `[1, limit]` in blocks of `block` until a `Kill` or shutdown request.
pub async fn serve(
    listener: TcpListener,
    limit: u32,
    block: u32,
    max_clients: usize,
    shutdown: &ShutdownFlag,
) -> Result<RunOutcome, CoordinatorError> {
    if limit == 0 {
        return Err(CoordinatorError::InvalidLimit);
    }
    let mut state = SocketState::new(limit, block);
    let mut connections: HashMap<ConnId, Connection> = HashMap::new();
    let mut next_conn: ConnId = 0;
    let (event_tx, mut event_rx) = mpsc::channel::<(ConnId, ConnEvent)>(100);

    tracing::info!(limit, block, "Socket coordinator running");

    loop {
        let mut pending: VecDeque<Action> = VecDeque::new();

        tokio::select! {
            _ = shutdown.wait() => {
                tracing::info!("Shutdown requested");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if connections.len() >= max_clients {
                        tracing::warn!(%addr, max_clients, "Too many clients, dropping connection");
                        continue;
                    }
                    let conn = next_conn;
                    next_conn += 1;
                    let (reader, writer) = transport::split(stream);
                    let reader_task = spawn_reader(conn, reader, event_tx.clone());
                    connections.insert(conn, Connection { writer, reader_task });
                    tracing::debug!(conn, %addr, "Accepted connection");
                }
                Err(e) => tracing::warn!(error = %e, "Accept failed"),
            },
            Some((conn, event)) = event_rx.recv() => match event {
                ConnEvent::Frame(Ok(packet)) => {
                    tracing::trace!(conn, %packet, "Received");
                    pending.extend(state.handle_packet(conn, packet));
                }
                ConnEvent::Frame(Err(e)) => {
                    tracing::warn!(conn, error = %e, "Protocol violation");
                }
                ConnEvent::Closed => {
                    tracing::debug!(conn, "Connection closed");
                    drop_connection(&mut connections, conn);
                    pending.extend(state.disconnected(conn));
                }
                ConnEvent::Error(e) => {
                    tracing::warn!(conn, error = %e, "Connection failed");
                    drop_connection(&mut connections, conn);
                    pending.extend(state.disconnected(conn));
                }
            },
        }

        let mut stop = false;
        while let Some(action) = pending.pop_front() {
            match action {
                Action::Stop => stop = true,
                Action::Send { conn, packet } => {
                    let Some(connection) = connections.get_mut(&conn) else {
                        continue;
                    };
                    if let Err(e) = connection.writer.send(packet).await {
                        tracing::warn!(conn, error = %e, "Send failed, dropping connection");
                        drop_connection(&mut connections, conn);
                        pending.extend(state.disconnected(conn));
                    }
                }
            }
        }
        if stop {
            break;
        }
    }

    for (conn, mut connection) in connections.drain() {
        if let Err(e) = connection.writer.send(Packet::Closed { pid: PID_SERVER }).await {
            tracing::debug!(conn, error = %e, "Client already gone");
        }
        connection.reader_task.abort();
    }

    let outcome = if state.is_finished() {
        RunOutcome::Completed
    } else {
        RunOutcome::Interrupted
    };
    tracing::info!(?outcome, results = ?state.results(), "Socket coordinator stopped");
    Ok(outcome)
}

fn drop_connection(connections: &mut HashMap<ConnId, Connection>, conn: ConnId) {
    if let Some(connection) = connections.remove(&conn) {
        connection.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::PerfectNumber;
    use crate::worker::{WorkerOutcome, run_socket_worker};
    use std::sync::Arc;

    fn sends(actions: &[Action]) -> Vec<(ConnId, Packet)> {
        actions
            .iter()
            .filter_map(|a| match *a {
                Action::Send { conn, packet } => Some((conn, packet)),
                Action::Stop => None,
            })
            .collect()
    }

    fn request(state: &mut SocketState, conn: ConnId) -> Packet {
        let actions = state.handle_packet(conn, Packet::Done { pid: 100 });
        let replies: Vec<Packet> = sends(&actions)
            .into_iter()
            .filter(|(c, _)| *c == conn)
            .map(|(_, p)| p)
            .collect();
        assert_eq!(replies.len(), 1);
        replies[0]
    }

    #[test]
    fn blocks_are_clipped_then_refused() {
        let mut state = SocketState::new(2500, 1000);
        assert_eq!(request(&mut state, 1), Packet::Range { start: 1, end: 1000 });
        assert_eq!(request(&mut state, 1), Packet::Range { start: 1001, end: 2000 });
        assert_eq!(request(&mut state, 1), Packet::Range { start: 2001, end: 2500 });
        assert_eq!(request(&mut state, 1), Packet::Refuse);
        assert!(state.is_finished());
        assert_eq!(request(&mut state, 2), Packet::Refuse);
    }

    #[test]
    fn ranges_near_u32_max_do_not_overflow() {
        let mut state = SocketState::new(u32::MAX, u32::MAX - 10);
        assert_eq!(
            request(&mut state, 1),
            Packet::Range {
                start: 1,
                end: u32::MAX - 10
            }
        );
        assert_eq!(
            request(&mut state, 1),
            Packet::Range {
                start: u32::MAX - 9,
                end: u32::MAX
            }
        );
        assert_eq!(request(&mut state, 1), Packet::Refuse);
    }

    #[test]
    fn only_one_subscriber() {
        let mut state = SocketState::new(10, 5);
        assert_eq!(sends(&state.handle_packet(7, Packet::Notify)), vec![(7, Packet::Accept)]);
        assert_eq!(sends(&state.handle_packet(8, Packet::Notify)), vec![(8, Packet::Refuse)]);
        assert_eq!(state.notify_client(), Some(7));

        // Slot frees when the subscriber leaves.
        state.disconnected(7);
        assert_eq!(sends(&state.handle_packet(8, Packet::Notify)), vec![(8, Packet::Accept)]);
    }

    #[test]
    fn late_subscriber_gets_replay() {
        let mut state = SocketState::new(30, 10);
        request(&mut state, 1);
        request(&mut state, 2);
        state.handle_packet(1, Packet::PerfNum { value: 6 });
        state.disconnected(2);

        assert!(state.missed_some());
        assert_eq!(
            sends(&state.handle_packet(9, Packet::Notify)),
            vec![
                (9, Packet::Accept),
                (9, Packet::Closed { pid: PID_CLIENT }),
                (9, Packet::PerfNum { value: 6 }),
            ]
        );
    }

    #[test]
    fn replay_includes_done_when_finished() {
        let mut state = SocketState::new(10, 10);
        request(&mut state, 1);
        state.handle_packet(1, Packet::PerfNum { value: 6 });
        assert_eq!(request(&mut state, 1), Packet::Refuse);

        let replay = sends(&state.handle_packet(3, Packet::Notify));
        assert_eq!(
            replay,
            vec![
                (3, Packet::Accept),
                (3, Packet::PerfNum { value: 6 }),
                (3, Packet::Done { pid: PID_SERVER }),
            ]
        );
    }

    #[test]
    fn live_results_go_to_subscriber() {
        let mut state = SocketState::new(100, 50);
        state.handle_packet(9, Packet::Notify);
        request(&mut state, 1);

        assert_eq!(
            sends(&state.handle_packet(1, Packet::PerfNum { value: 28 })),
            vec![(9, Packet::PerfNum { value: 28 })]
        );
        assert_eq!(
            sends(&state.handle_packet(1, Packet::Closed { pid: 4321 })),
            vec![(9, Packet::Closed { pid: 4321 })]
        );
    }

    #[test]
    fn every_refusal_forwards_done_to_subscriber() {
        let mut state = SocketState::new(20, 10);
        state.handle_packet(9, Packet::Notify);
        request(&mut state, 1);
        request(&mut state, 2);

        // Worker 1 is refused while worker 2 still tests 11..=20.
        let actions = state.handle_packet(1, Packet::Done { pid: 1 });
        assert_eq!(
            sends(&actions),
            vec![(1, Packet::Refuse), (9, Packet::Done { pid: PID_SERVER })]
        );
        assert!(state.is_exhausted());
        assert!(!state.is_finished());

        let actions = state.handle_packet(2, Packet::Done { pid: 2 });
        assert_eq!(
            sends(&actions),
            vec![(2, Packet::Refuse), (9, Packet::Done { pid: PID_SERVER })]
        );
        assert!(state.is_finished());
    }

    #[test]
    fn replay_sends_done_once_exhausted_even_with_ranges_out() {
        let mut state = SocketState::new(20, 10);
        request(&mut state, 1);
        request(&mut state, 2);
        assert_eq!(request(&mut state, 1), Packet::Refuse);

        assert_eq!(
            sends(&state.handle_packet(9, Packet::Notify)),
            vec![(9, Packet::Accept), (9, Packet::Done { pid: PID_SERVER })]
        );
    }

    #[test]
    fn kill_stops_and_violations_are_ignored() {
        let mut state = SocketState::new(10, 5);
        assert_eq!(state.handle_packet(1, Packet::Kill), vec![Action::Stop]);
        assert!(state.handle_packet(1, Packet::Range { start: 1, end: 2 }).is_empty());
        assert!(state.handle_packet(1, Packet::Accept).is_empty());
    }

    #[test]
    fn overflowing_results_still_forwarded() {
        let mut state = SocketState::new(100, 10);
        state.handle_packet(9, Packet::Notify);
        for v in 1..=5 {
            state.handle_packet(1, Packet::PerfNum { value: v });
        }
        let actions = state.handle_packet(1, Packet::PerfNum { value: 99 });
        assert_eq!(sends(&actions), vec![(9, Packet::PerfNum { value: 99 })]);
        assert_eq!(state.results(), &[1, 2, 3, 4, 5]);
    }

    async fn next(reader: &mut PacketReader<OwnedReadHalf>) -> Packet {
        reader.next().await.unwrap().unwrap().unwrap()
    }

    #[tokio::test]
    async fn end_to_end_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = ShutdownFlag::new();

        let server = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { serve(listener, 10_000, 1000, 16, &shutdown).await })
        };

        let (mut mon_reader, mut mon_writer) = transport::connect("127.0.0.1", port).await.unwrap();
        mon_writer.send(Packet::Notify).await.unwrap();
        assert_eq!(next(&mut mon_reader).await, Packet::Accept);

        let workers: Vec<_> = (0..3)
            .map(|_| {
                tokio::spawn(async move {
                    let (mut r, mut w) = transport::connect("127.0.0.1", port).await.unwrap();
                    let shutdown = ShutdownFlag::new();
                    run_socket_worker(Arc::new(PerfectNumber), &mut r, &mut w, &shutdown).await
                })
            })
            .collect();

        for worker in workers {
            assert_eq!(worker.await.unwrap().unwrap(), WorkerOutcome::Exhausted);
        }
        mon_writer.send(Packet::Kill).await.unwrap();
        assert_eq!(server.await.unwrap().unwrap(), RunOutcome::Completed);

        // Each refused worker produced a Done; the stream ends with the shutdown Closed.
        let mut found = Vec::new();
        let mut dones = 0;
        loop {
            match next(&mut mon_reader).await {
                Packet::PerfNum { value } => found.push(value),
                Packet::Done { pid: PID_SERVER } => dones += 1,
                Packet::Closed { pid: PID_SERVER } => break,
                other => panic!("unexpected {other}"),
            }
        }
        found.sort_unstable();
        assert_eq!(found, vec![6, 28, 496, 8128]);
        assert_eq!(dones, 3);
    }

    #[tokio::test]
    async fn shutdown_notifies_clients() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = ShutdownFlag::new();

        let server = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { serve(listener, 100, 10, 16, &shutdown).await })
        };

        let (mut reader, mut writer) = transport::connect("127.0.0.1", port).await.unwrap();
        writer.send(Packet::Notify).await.unwrap();
        assert_eq!(next(&mut reader).await, Packet::Accept);

        shutdown.request();
        assert_eq!(server.await.unwrap().unwrap(), RunOutcome::Interrupted);
        assert_eq!(next(&mut reader).await, Packet::Closed { pid: PID_SERVER });
    }

    #[tokio::test]
    async fn client_limit_drops_extra_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = ShutdownFlag::new();

        let server = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { serve(listener, 100, 10, 1, &shutdown).await })
        };

        let (mut first_r, mut first_w) = transport::connect("127.0.0.1", port).await.unwrap();
        first_w.send(Packet::Notify).await.unwrap();
        assert_eq!(next(&mut first_r).await, Packet::Accept);

        let (mut second_r, _second_w) = transport::connect("127.0.0.1", port).await.unwrap();
        // Dropped by the server: EOF or reset, never a packet.
        assert!(!matches!(second_r.next().await, Some(Ok(Ok(_)))));

        first_w.send(Packet::Kill).await.unwrap();
        server.await.unwrap().unwrap();
    }
}
