//! Connection session: one client socket relayed to one remote endpoint.
//!
//! A session runs one task per direction. Each task owns its own buffer and
//! strictly serialises read -> observe -> write -> next read, so the buffer is
//! never overwritten while its bytes are still in flight. The two tasks only
//! meet in [`Session::stop`], which flips the state and cancels both.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::fault::{Direction, Fault, Side};
use crate::observer::{BoxedStream, SessionObserver};

/// Capacity of each direction's buffer.
pub const BUFFER_SIZE: usize = 65535;

/// How long a finished direction may spend closing its write half. Buffering
/// streams (TLS) flush on shutdown, which never completes against a peer that
/// stopped reading.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of a session. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connecting = 1,
    Active = 2,
    Stopped = 3,
}

impl SessionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Active,
            _ => Self::Stopped,
        }
    }
}

/// A bidirectional relay between an accepted client socket and a remote
/// endpoint.
///
/// Status is reported exclusively through the [`SessionObserver`]: `start`
/// returns nothing and never fails.
pub struct Session {
    id: Uuid,
    observer: Arc<dyn SessionObserver>,
    /// Held until `start` hands it to the observer, or `stop` closes it.
    client: Mutex<Option<TcpStream>>,
    client_addr: Option<SocketAddr>,
    remote_addr: OnceLock<SocketAddr>,
    state: AtomicU8,
    faulted: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
    bytes_outbound: AtomicU64,
    bytes_inbound: AtomicU64,
}

impl Session {
    /// Create an idle session around an already accepted client socket.
    pub fn new(observer: Arc<dyn SessionObserver>, client: TcpStream) -> Arc<Self> {
        let client_addr = client.peer_addr().ok();
        Arc::new(Self {
            id: Uuid::new_v4(),
            observer,
            client: Mutex::new(Some(client)),
            client_addr,
            remote_addr: OnceLock::new(),
            state: AtomicU8::new(SessionState::Idle as u8),
            faulted: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            bytes_outbound: AtomicU64::new(0),
            bytes_inbound: AtomicU64::new(0),
        })
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == SessionState::Stopped
    }

    /// Peer address of the client socket, if the OS reported one.
    pub const fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    /// Address the remote socket connected to. Set once the dial succeeds.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr.get().copied()
    }

    /// Bytes written to the remote so far.
    pub fn bytes_outbound(&self) -> u64 {
        self.bytes_outbound.load(Ordering::Relaxed)
    }

    /// Bytes written to the client so far.
    pub fn bytes_inbound(&self) -> u64 {
        self.bytes_inbound.load(Ordering::Relaxed)
    }

    /// Dial `remote_host:remote_port` and start relaying.
    ///
    /// Returns once both direction tasks are running, or once the setup fault
    /// has been delivered to the observer. Calling it on a session that is not
    /// [`SessionState::Idle`] does nothing.
    pub async fn start(self: &Arc<Self>, remote_host: &str, remote_port: u16) {
        if !self.transition(SessionState::Idle, SessionState::Connecting) {
            warn!(
                session_id = %self.id,
                state = ?self.state(),
                "start called on a session that is not idle"
            );
            return;
        }

        let Some(client) = self.take_client() else {
            debug!(session_id = %self.id, "Session stopped before dialing");
            self.tasks.close();
            return;
        };

        let connected = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            result = self.connect(client, remote_host, remote_port) => Some(result),
        };

        match connected {
            None => {
                debug!(session_id = %self.id, "Session stopped while connecting");
                self.tasks.close();
            }
            Some(Err(fault)) => {
                let first = self.claim_fault();
                self.stop();
                self.deliver_fault(first, fault);
            }
            Some(Ok((client_stream, remote_stream))) => {
                if !self.transition(SessionState::Connecting, SessionState::Active) {
                    debug!(session_id = %self.id, "Session stopped while connecting");
                    self.tasks.close();
                    return;
                }
                info!(
                    session_id = %self.id,
                    client = ?self.client_addr,
                    remote = ?self.remote_addr(),
                    "Session active"
                );
                self.observer.on_connect(self);
                self.spawn_directions(client_stream, remote_stream);
            }
        }
    }

    /// Close both sockets and end both directions.
    ///
    /// Safe to call any number of times, from any task, including from
    /// observer hooks. An active session that had not already faulted
    /// reports [`Fault::Stopped`]; an idle or connecting one reports nothing.
    pub fn stop(&self) {
        let previous = SessionState::from_u8(
            self.state
                .swap(SessionState::Stopped as u8, Ordering::AcqRel),
        );
        if previous != SessionState::Stopped {
            debug!(session_id = %self.id, from = ?previous, "Session stopping");
        }

        self.cancel.cancel();

        // Only present if the session never got as far as dialing.
        if let Some(client) = self.take_client() {
            close_socket(self.id, Side::Client, client);
        }

        self.tasks.close();
    }

    /// Wait until both directions have finished.
    ///
    /// Resolves immediately for a session whose `start` failed or was
    /// stopped; never resolves for an idle session nobody stops.
    pub async fn closed(&self) {
        self.tasks.wait().await;
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn take_client(&self) -> Option<TcpStream> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn connect(
        &self,
        client: TcpStream,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(BoxedStream, BoxedStream), Fault> {
        let remote = TcpStream::connect((remote_host, remote_port))
            .await
            .map_err(|source| Fault::Connect {
                target: format!("{remote_host}:{remote_port}"),
                source,
            })?;
        if let Ok(addr) = remote.peer_addr() {
            let _ = self.remote_addr.set(addr);
        }

        let client_stream = self
            .observer
            .get_stream(client, Side::Client)
            .await
            .map_err(|source| Fault::Stream {
                side: Side::Client,
                source,
            })?;
        let remote_stream = self
            .observer
            .get_stream(remote, Side::Remote)
            .await
            .map_err(|source| Fault::Stream {
                side: Side::Remote,
                source,
            })?;

        Ok((client_stream, remote_stream))
    }

    fn spawn_directions(self: &Arc<Self>, client: BoxedStream, remote: BoxedStream) {
        let (client_read, client_write) = tokio::io::split(client);
        let (remote_read, remote_write) = tokio::io::split(remote);

        self.tasks.spawn(Arc::clone(self).run_direction(
            Direction::Outbound,
            client_read,
            remote_write,
        ));
        self.tasks.spawn(Arc::clone(self).run_direction(
            Direction::Inbound,
            remote_read,
            client_write,
        ));
        self.tasks.close();
    }

    /// Drive one direction until it faults or the session is stopped, then
    /// close the write half it owns.
    async fn run_direction(
        self: Arc<Self>,
        direction: Direction,
        mut reader: ReadHalf<BoxedStream>,
        mut writer: WriteHalf<BoxedStream>,
    ) {
        let mut buffer = vec![0u8; BUFFER_SIZE].into_boxed_slice();

        let fault = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            fault = self.pump(direction, &mut reader, &mut writer, &mut buffer) => Some(fault),
        };

        match fault {
            Some(fault) => {
                let first = self.claim_fault();
                self.stop();
                self.deliver_fault(first, fault);
            }
            None => {
                if self.claim_fault() {
                    self.deliver_fault(true, Fault::Stopped);
                }
            }
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log_close_error(self.id, direction.sink(), &e),
            Err(_) => debug!(
                session_id = %self.id,
                side = %direction.sink(),
                "Shutdown did not finish in time, dropping stream"
            ),
        }
        debug!(session_id = %self.id, %direction, "Direction finished");
    }

    /// The read/forward loop. Only returns when something goes wrong.
    async fn pump(
        &self,
        direction: Direction,
        reader: &mut ReadHalf<BoxedStream>,
        writer: &mut WriteHalf<BoxedStream>,
        buffer: &mut [u8],
    ) -> Fault {
        let source_side = direction.source();
        let sink_side = direction.sink();

        loop {
            let read = match reader.read(buffer).await {
                Ok(0) => {
                    debug!(session_id = %self.id, side = %source_side, "EOF");
                    return Fault::Closed { side: source_side };
                }
                Ok(n) => n,
                Err(source) => {
                    return Fault::Read {
                        side: source_side,
                        source,
                    };
                }
            };
            let chunk = &buffer[..read];

            let observed = match direction {
                Direction::Outbound => self.observer.on_forward_outbound(self, chunk),
                Direction::Inbound => self.observer.on_forward_inbound(self, chunk),
            };
            if let Err(source) = observed {
                return Fault::Hook {
                    direction,
                    len: read,
                    source,
                };
            }

            if let Err(source) = writer.write_all(chunk).await {
                return Fault::Write {
                    side: sink_side,
                    source,
                };
            }
            // TLS streams buffer records until flushed.
            if let Err(source) = writer.flush().await {
                return Fault::Write {
                    side: sink_side,
                    source,
                };
            }

            self.counter(direction)
                .fetch_add(read as u64, Ordering::Relaxed);
            trace!(session_id = %self.id, %direction, bytes = read, "Forwarded");
        }
    }

    const fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::Outbound => &self.bytes_outbound,
            Direction::Inbound => &self.bytes_inbound,
        }
    }

    /// Take the single fault report of this session. Claimed before `stop`
    /// so the direction cancelled by that stop cannot report first.
    fn claim_fault(&self) -> bool {
        !self.faulted.swap(true, Ordering::AcqRel)
    }

    /// Hand `fault` to the observer if this path claimed the report.
    fn deliver_fault(&self, claimed: bool, fault: Fault) {
        if !claimed {
            debug!(session_id = %self.id, error = %fault, "Suppressing secondary fault");
            return;
        }

        if fault.is_closed() {
            info!(
                session_id = %self.id,
                reason = %fault,
                side = ?fault.side(),
                bytes_outbound = self.bytes_outbound(),
                bytes_inbound = self.bytes_inbound(),
                "Session closed"
            );
        } else {
            warn!(
                session_id = %self.id,
                error = %fault,
                side = ?fault.side(),
                bytes_outbound = self.bytes_outbound(),
                bytes_inbound = self.bytes_inbound(),
                "Session faulted"
            );
        }
        self.observer.on_fault(self, fault);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("client_addr", &self.client_addr)
            .field("remote_addr", &self.remote_addr())
            .finish_non_exhaustive()
    }
}

/// Close a socket that never made it into a direction task.
fn close_socket(session_id: Uuid, side: Side, socket: TcpStream) {
    let result = socket
        .into_std()
        .and_then(|socket| socket.shutdown(Shutdown::Both));
    if let Err(e) = result {
        log_close_error(session_id, side, &e);
    }
}

fn log_close_error(session_id: Uuid, side: Side, error: &io::Error) {
    match error.kind() {
        // Peer already gone; nothing left to close.
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
            debug!(session_id = %session_id, %side, error = %error, "Socket already closed");
        }
        _ => {
            warn!(session_id = %session_id, %side, error = %error, "Failed to close socket");
        }
    }
}
