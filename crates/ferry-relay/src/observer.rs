//! The contract between a [`Session`] and whoever owns it.
//!
//! An observer decides how a raw socket becomes a byte stream (plain, TLS,
//! anything implementing `AsyncRead + AsyncWrite`) and is told about every
//! lifecycle step of the session. Implementations are shared between all
//! sessions of a listener, so they must be `Send + Sync`.

use std::io;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::fault::{Fault, Side};
use crate::session::Session;

/// Anything a session can read bytes from and write bytes to.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased stream handed back by [`SessionObserver::get_stream`].
pub type BoxedStream = Box<dyn ByteStream>;

/// Error an observer hook may return to abort a session.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

pub type HookResult = Result<(), HookError>;

/// Lifecycle callbacks and stream construction for a [`Session`].
///
/// Only [`get_stream`](Self::get_stream) and [`on_fault`](Self::on_fault) are
/// required; the forwarding hooks default to letting every byte through.
pub trait SessionObserver: Send + Sync + 'static {
    /// Turn a connected socket into the stream the session relays through.
    ///
    /// Called exactly once per side per session, client first.
    fn get_stream(&self, socket: TcpStream, side: Side) -> BoxFuture<'_, io::Result<BoxedStream>>;

    /// Both streams exist and no byte has been relayed yet.
    fn on_connect(&self, _session: &Session) {}

    /// `data` was read from the client and is about to be written to the remote.
    ///
    /// Returning an error ends the session with [`Fault::Hook`].
    fn on_forward_outbound(&self, _session: &Session, _data: &[u8]) -> HookResult {
        Ok(())
    }

    /// `data` was read from the remote and is about to be written to the client.
    fn on_forward_inbound(&self, _session: &Session, _data: &[u8]) -> HookResult {
        Ok(())
    }

    /// The session ended because of `fault`. Delivered at most once.
    fn on_fault(&self, session: &Session, fault: Fault);
}

/// A `get_stream` body that relays over the raw socket.
pub fn passthrough(socket: TcpStream) -> BoxFuture<'static, io::Result<BoxedStream>> {
    Box::pin(futures::future::ready(Ok(Box::new(socket) as BoxedStream)))
}
