use std::{fmt, io};

use thiserror::Error;

use crate::mailbox::PeerId;

/// Why an outbound TCP connection could not be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    Resolve,
    Refused,
    Unreachable,
    TimedOut,
    Other,
}

impl ConnectFailure {
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::TimedOut,
            _ => match err.raw_os_error() {
                Some(libc::ENETUNREACH | libc::EHOSTUNREACH) => Self::Unreachable,
                _ => Self::Other,
            },
        }
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Resolve => "address resolution failed",
            Self::Refused => "connection refused",
            Self::Unreachable => "host unreachable",
            Self::TimedOut => "timed out",
            Self::Other => "connect failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("client {0} is already active")]
    SlotConflict(PeerId),

    #[error("{op} failed: {source}")]
    Segment {
        op: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot reach {addr}: {kind}")]
    Connection {
        addr: String,
        kind: ConnectFailure,
        #[source]
        source: io::Error,
    },

    #[error("disconnected")]
    Disconnected,

    #[error("server full ({capacity} clients)")]
    RegistryFull { capacity: usize },

    #[error("malformed frame {0:?}")]
    MalformedFrame(String),

    #[error("interrupted by shutdown")]
    Cancelled,
}

impl TransportError {
    pub(crate) fn segment(op: impl Into<String>, source: io::Error) -> Self {
        Self::Segment {
            op: op.into(),
            source,
        }
    }

    pub(crate) fn connection(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Connection {
            addr: addr.into(),
            kind: ConnectFailure::classify(&source),
            source,
        }
    }
}
