//! Ferry Relay Library
//!
//! The relay core: a [`Session`] takes an accepted client socket, dials a
//! remote endpoint and pumps bytes both ways until either side closes or
//! faults. Everything the session cannot decide for itself (stream
//! construction, inspection, fault reporting) goes through a
//! [`SessionObserver`].

pub mod fault;
pub mod observer;
pub mod session;

pub use fault::{Direction, Fault, Side};
pub use observer::{BoxedStream, ByteStream, HookError, HookResult, SessionObserver, passthrough};
pub use session::{BUFFER_SIZE, Session, SessionState};
