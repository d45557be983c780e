//! Concrete session observers used by the proxy.
//!
//! [`LoggingObserver`] relays over raw sockets and records what happened;
//! [`TransportObserver`] layers TLS onto either leg and hands every lifecycle
//! event to an inner observer.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ferry_relay::{BoxedStream, Direction, Fault, HookResult, Session, SessionObserver, Side};
use futures::future::BoxFuture;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{Level, debug, info, trace};

use crate::tls::TlsError;

/// Bytes of each forwarded chunk shown in trace logs.
const PREVIEW_LEN: usize = 32;

/// Aggregate counters across every session an observer has seen.
#[derive(Debug, Default)]
pub struct RelayStats {
    sessions_connected: AtomicU64,
    sessions_failed: AtomicU64,
    sessions_ended: AtomicU64,
    bytes_outbound: AtomicU64,
    bytes_inbound: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Sessions that reached `on_connect`.
    pub sessions_connected: u64,
    /// Sessions that never connected (dial or stream setup failed).
    pub sessions_failed: u64,
    /// Connected sessions that have since ended with a fault.
    pub sessions_ended: u64,
    pub bytes_outbound: u64,
    pub bytes_inbound: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_connected: self.sessions_connected.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            sessions_ended: self.sessions_ended.load(Ordering::Relaxed),
            bytes_outbound: self.bytes_outbound.load(Ordering::Relaxed),
            bytes_inbound: self.bytes_inbound.load(Ordering::Relaxed),
        }
    }

    fn record_forward(&self, direction: Direction, len: usize) {
        let counter = match direction {
            Direction::Outbound => &self.bytes_outbound,
            Direction::Inbound => &self.bytes_inbound,
        };
        counter.fetch_add(len as u64, Ordering::Relaxed);
    }
}

/// Plain relay: raw sockets, structured logs, counters.
#[derive(Debug, Default)]
pub struct LoggingObserver {
    stats: RelayStats,
}

impl LoggingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn stats(&self) -> &RelayStats {
        &self.stats
    }

    fn log_forward(&self, session: &Session, direction: Direction, data: &[u8]) {
        self.stats.record_forward(direction, data.len());
        if tracing::enabled!(Level::TRACE) {
            let preview = &data[..data.len().min(PREVIEW_LEN)];
            trace!(
                session_id = %session.id(),
                %direction,
                len = data.len(),
                preview = %hex::encode(preview),
                "Relaying chunk"
            );
        }
    }
}

impl SessionObserver for LoggingObserver {
    fn get_stream(&self, socket: TcpStream, _side: Side) -> BoxFuture<'_, io::Result<BoxedStream>> {
        ferry_relay::passthrough(socket)
    }

    fn on_connect(&self, session: &Session) {
        self.stats.sessions_connected.fetch_add(1, Ordering::Relaxed);
        info!(
            session_id = %session.id(),
            client = ?session.client_addr(),
            remote = ?session.remote_addr(),
            "Relay connected"
        );
    }

    fn on_forward_outbound(&self, session: &Session, data: &[u8]) -> HookResult {
        self.log_forward(session, Direction::Outbound, data);
        Ok(())
    }

    fn on_forward_inbound(&self, session: &Session, data: &[u8]) -> HookResult {
        self.log_forward(session, Direction::Inbound, data);
        Ok(())
    }

    fn on_fault(&self, session: &Session, fault: Fault) {
        if fault.is_setup() {
            self.stats.sessions_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.sessions_ended.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            session_id = %session.id(),
            reason = %fault,
            bytes_outbound = session.bytes_outbound(),
            bytes_inbound = session.bytes_inbound(),
            "Relay ended"
        );
    }
}

/// Remote endpoint TLS: the connector plus the name it is verified against.
#[derive(Clone)]
struct RemoteLeg {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Wraps each leg in TLS when configured, delegating everything else.
pub struct TransportObserver {
    inner: Arc<dyn SessionObserver>,
    client_tls: Option<TlsAcceptor>,
    remote_tls: Option<RemoteLeg>,
}

impl TransportObserver {
    pub fn new(inner: Arc<dyn SessionObserver>) -> Self {
        Self {
            inner,
            client_tls: None,
            remote_tls: None,
        }
    }

    /// Terminate TLS from clients with `acceptor`.
    #[must_use]
    pub fn with_client_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.client_tls = Some(acceptor);
        self
    }

    /// Originate TLS towards the remote, verifying it as `server_name`.
    #[must_use]
    pub fn with_remote_tls(mut self, connector: TlsConnector, server_name: ServerName<'static>) -> Self {
        self.remote_tls = Some(RemoteLeg {
            connector,
            server_name,
        });
        self
    }

    pub const fn is_client_tls(&self) -> bool {
        self.client_tls.is_some()
    }

    pub const fn is_remote_tls(&self) -> bool {
        self.remote_tls.is_some()
    }
}

/// Put TLS on top of `stream` if its side is configured for it.
async fn upgrade(
    stream: BoxedStream,
    side: Side,
    client_tls: Option<TlsAcceptor>,
    remote_tls: Option<RemoteLeg>,
) -> io::Result<BoxedStream> {
    match (side, client_tls, remote_tls) {
        (Side::Client, Some(acceptor), _) => {
            let tls = acceptor
                .accept(stream)
                .await
                .map_err(|e| TlsError::handshake(format!("client: {e}")))?;
            debug!("Client TLS established");
            Ok(Box::new(tls))
        }
        (Side::Remote, _, Some(leg)) => {
            let tls = leg
                .connector
                .connect(leg.server_name, stream)
                .await
                .map_err(|e| TlsError::handshake(format!("remote: {e}")))?;
            debug!("Remote TLS established");
            Ok(Box::new(tls))
        }
        _ => Ok(stream),
    }
}

impl SessionObserver for TransportObserver {
    fn get_stream(&self, socket: TcpStream, side: Side) -> BoxFuture<'_, io::Result<BoxedStream>> {
        let base = self.inner.get_stream(socket, side);
        let client_tls = self.client_tls.clone();
        let remote_tls = self.remote_tls.clone();

        Box::pin(async move {
            let stream = base.await?;
            upgrade(stream, side, client_tls, remote_tls).await
        })
    }

    fn on_connect(&self, session: &Session) {
        self.inner.on_connect(session);
    }

    fn on_forward_outbound(&self, session: &Session, data: &[u8]) -> HookResult {
        self.inner.on_forward_outbound(session, data)
    }

    fn on_forward_inbound(&self, session: &Session, data: &[u8]) -> HookResult {
        self.inner.on_forward_inbound(session, data)
    }

    fn on_fault(&self, session: &Session, fault: Fault) {
        self.inner.on_fault(session, fault);
    }
}
