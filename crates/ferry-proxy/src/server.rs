//! Listening/dispatch layer: every accepted socket becomes a relay session
//! towards a fixed remote target.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ferry_relay::{Session, SessionObserver};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::registry::SessionRegistry;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The endpoint sessions dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// TCP listener that relays every connection to one [`RemoteTarget`].
pub struct ProxyServer {
    listener: TcpListener,
    target: RemoteTarget,
    observer: Arc<dyn SessionObserver>,
    registry: SessionRegistry,
}

impl ProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        target: RemoteTarget,
        observer: Arc<dyn SessionObserver>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            target,
            observer,
            registry: SessionRegistry::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Accept connections until `shutdown` fires, then stop every live
    /// session and wait for them to unwind.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            addr = ?self.listener.local_addr().ok(),
            target = %self.target,
            "Proxy listening"
        );
        let dispatches = TaskTracker::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!(%peer, "Accepted connection");
                        dispatches.spawn(dispatch(
                            socket,
                            Arc::clone(&self.observer),
                            self.target.clone(),
                            self.registry.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        info!("Proxy shutting down");
        self.registry.stop_all().await;
        dispatches.close();
        dispatches.wait().await;
        info!("Proxy stopped");
    }
}

/// Own one session from accept to teardown.
async fn dispatch(
    socket: TcpStream,
    observer: Arc<dyn SessionObserver>,
    target: RemoteTarget,
    registry: SessionRegistry,
    shutdown: CancellationToken,
) {
    let session = Session::new(observer, socket);
    let id = session.id();
    registry.register(Arc::clone(&session)).await;

    // Registered after `stop_all` already ran.
    if shutdown.is_cancelled() {
        session.stop();
    }

    session.start(&target.host, target.port).await;
    session.closed().await;
    registry.unregister(id).await;
}
