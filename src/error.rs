use std::fmt;
use std::io;
use std::sync::Arc;

// ── Error taxonomy ─────────────────────────────────────────────────
//
//  Error
//  ├── Encoding      argument could not be serialized (never hits the wire)
//  ├── Protocol      reply bytes did not match the expected exchange shape
//  ├── Connection    socket error or peer close, fanned out to every pending group
//  ├── Timeout       connect did not complete in time
//  └── Config        invalid endpoint descriptor / URL
//
//  "Need more bytes" is decoder control flow (`resp::parser`), not an Error.

/// All error variants for redpipe.
#[derive(Debug, Clone)]
pub enum Error {
    /// A command argument could not be encoded.
    Encoding(String),
    /// Received bytes violate the expected acknowledgement / reply shape.
    Protocol(String),
    /// TCP / IO level errors. Shared so one failure can resolve many groups.
    Connection(Arc<io::Error>),
    /// Connect timed out.
    Timeout(String),
    /// Invalid connection configuration.
    Config(String),
}

impl Error {
    /// Connection failure that did not originate from an OS error
    /// (peer close, torn-down connection, dropped connection task).
    pub fn connection_closed(msg: impl Into<String>) -> Self {
        Self::Connection(Arc::new(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            msg.into(),
        )))
    }

    /// True for failures that mean the connection itself is gone.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// True for reply-shape violations.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encoding(msg) => write!(f, "encoding error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Connection(e) => write!(f, "connection error: {e}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Connection(Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Tests ──────────────────────────────────────────────────────────
