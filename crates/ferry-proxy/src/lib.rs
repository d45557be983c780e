//! Ferry Proxy Library
//!
//! The layer around the relay core:
//! - TCP listener that turns every accepted socket into a relay session
//! - Registry of live sessions for shutdown
//! - Observers: structured logging and TLS transport wrapping
//! - TLS acceptor/connector construction and dev certificate generation

pub mod observer;
pub mod registry;
pub mod server;
pub mod tls;

pub use observer::{LoggingObserver, RelayStats, StatsSnapshot, TransportObserver};
pub use registry::SessionRegistry;
pub use server::{ProxyServer, RemoteTarget};
