//! Faults that terminate a session.

use std::fmt;
use std::io;

use crate::observer::HookError;

/// One end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The accepted socket handed to the session.
    Client,
    /// The socket the session dials.
    Remote,
}

impl Side {
    /// The other end.
    pub const fn opposite(self) -> Self {
        match self {
            Self::Client => Self::Remote,
            Self::Remote => Self::Client,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// client -> remote
    Outbound,
    /// remote -> client
    Inbound,
}

impl Direction {
    /// The side this direction reads from.
    pub const fn source(self) -> Side {
        match self {
            Self::Outbound => Side::Client,
            Self::Inbound => Side::Remote,
        }
    }

    /// The side this direction writes to.
    pub const fn sink(self) -> Side {
        self.source().opposite()
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "client->remote",
            Self::Inbound => "remote->client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error that ended a session.
///
/// `Connect` and `Stream` happen before any byte is relayed (setup faults);
/// the rest are raised by a running direction (relay faults). A graceful close
/// by either peer is reported as [`Fault::Closed`], and a [`Session::stop`]
/// issued while relaying as [`Fault::Stopped`].
///
/// [`Session::stop`]: crate::Session::stop
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    #[error("failed to connect to {target}: {source}")]
    Connect { target: String, source: io::Error },

    #[error("failed to set up {side} stream: {source}")]
    Stream { side: Side, source: io::Error },

    #[error("{side} socket closed")]
    Closed { side: Side },

    #[error("read from {side} failed: {source}")]
    Read { side: Side, source: io::Error },

    #[error("write to {side} failed: {source}")]
    Write { side: Side, source: io::Error },

    #[error("{direction} observer rejected {len} bytes: {source}")]
    Hook {
        direction: Direction,
        len: usize,
        source: HookError,
    },

    #[error("session stopped")]
    Stopped,
}

impl Fault {
    /// Whether the session failed before it started relaying.
    pub const fn is_setup(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Stream { .. })
    }

    /// Whether the session ended without anything going wrong: a peer
    /// closed its end, or the owner stopped the session.
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Stopped)
    }

    /// The side the fault was observed on, when there is one.
    pub const fn side(&self) -> Option<Side> {
        match self {
            Self::Connect { .. } => Some(Side::Remote),
            Self::Stream { side, .. }
            | Self::Closed { side }
            | Self::Read { side, .. }
            | Self::Write { side, .. } => Some(*side),
            Self::Hook { .. } | Self::Stopped => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions_map_to_opposite_sides() {
        assert_eq!(Direction::Outbound.source(), Side::Client);
        assert_eq!(Direction::Outbound.sink(), Side::Remote);
        assert_eq!(Direction::Inbound.source(), Side::Remote);
        assert_eq!(Direction::Inbound.sink(), Side::Client);
    }

    #[test]
    fn closed_fault_names_the_side() {
        let fault = Fault::Closed { side: Side::Remote };
        assert_eq!(fault.to_string(), "remote socket closed");
        assert!(fault.is_closed());
        assert!(!fault.is_setup());
        assert_eq!(fault.side(), Some(Side::Remote));
    }

    #[test]
    fn setup_faults_are_classified() {
        let connect = Fault::Connect {
            target: "127.0.0.1:1".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(connect.is_setup());
        assert!(connect.to_string().starts_with("failed to connect to 127.0.0.1:1"));

        let stream = Fault::Stream {
            side: Side::Client,
            source: io::Error::other("handshake"),
        };
        assert!(stream.is_setup());
        assert_eq!(stream.side(), Some(Side::Client));
    }

    #[test]
    fn hook_fault_keeps_its_source() {
        let fault = Fault::Hook {
            direction: Direction::Inbound,
            len: 9,
            source: "blocked".into(),
        };
        assert_eq!(
            fault.to_string(),
            "remote->client observer rejected 9 bytes: blocked"
        );
        assert!(std::error::Error::source(&fault).is_some());
        assert_eq!(fault.side(), None);
    }

    #[test]
    fn stopped_is_a_clean_relay_fault() {
        let fault = Fault::Stopped;
        assert_eq!(fault.to_string(), "session stopped");
        assert!(fault.is_closed());
        assert!(!fault.is_setup());
        assert_eq!(fault.side(), None);
    }
}
