use std::fmt;
use std::io;

use thiserror::Error;

use crate::net::address::AddressError;
use crate::net::connection::ConnectionId;
use crate::net::socket::QueuedError;

/// Synchronous failure of a reactor operation.
///
/// Returned directly from `connect`, `start_server`, `open_datagram_socket`,
/// `send_data` and `send_datagram`. When one of these fails, no connection is
/// created and no callback fires.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
    #[error("address {0:?} requires name resolution")]
    Unresolvable(String),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection {id} does not support {operation}")]
    Unsupported {
        id: ConnectionId,
        operation: &'static str,
    },
    #[error("connection {0} is closing")]
    Closing(ConnectionId),
    #[error("event loop is shutting down")]
    ShuttingDown,
    #[error("socket setup failed: {0}")]
    Io(#[from] io::Error),
}

/// An error the OS reported for a socket after the operation that caused it.
///
/// `code` is the raw platform error number and is not normalized across platforms.
/// `destination` names the datagram target that triggered the error, when known.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}{}", DisplayDestination(.destination))]
pub struct AsyncSocketError {
    code: Option<i32>,
    kind: io::ErrorKind,
    message: String,
    destination: Option<(String, String)>,
}

struct DisplayDestination<'a>(&'a Option<(String, String)>);

impl fmt::Display for DisplayDestination<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some((address, port)) => write!(f, " (destination {address}:{port})"),
            None => Ok(()),
        }
    }
}

impl AsyncSocketError {
    pub fn new(error: &io::Error) -> Self {
        Self {
            code: error.raw_os_error(),
            kind: error.kind(),
            message: error.to_string(),
            destination: None,
        }
    }

    pub fn with_destination(mut self, address: impl Into<String>, port: u16) -> Self {
        self.destination = Some((address.into(), port.to_string()));
        self
    }

    /// Raw OS error code, if the error came from the OS.
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    /// `(address, port)` of the datagram whose send failed, with the port as a string.
    pub fn destination(&self) -> Option<(&str, &str)> {
        self.destination
            .as_ref()
            .map(|(address, port)| (address.as_str(), port.as_str()))
    }
}

impl From<io::Error> for AsyncSocketError {
    fn from(error: io::Error) -> Self {
        Self::new(&error)
    }
}

impl From<QueuedError> for AsyncSocketError {
    fn from(queued: QueuedError) -> Self {
        let error = Self::new(&queued.error);
        match queued.destination {
            Some(target) => error.with_destination(target.ip().to_string(), target.port()),
            None => error,
        }
    }
}

/// Why a connection was torn down.
///
/// A clean close (local close, peer EOF, loop shutdown) carries no reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnbindReason {
    #[error("connect failed: {0}")]
    ConnectFailed(AsyncSocketError),
    #[error("host {0:?} cannot be resolved")]
    Unresolved(String),
    #[error("socket error: {0}")]
    Io(AsyncSocketError),
    #[error("datagram send failed: {0}")]
    SendFailed(AsyncSocketError),
}

impl UnbindReason {
    /// The underlying socket error, if any.
    pub fn cause(&self) -> Option<&AsyncSocketError> {
        match self {
            UnbindReason::ConnectFailed(e) | UnbindReason::Io(e) | UnbindReason::SendFailed(e) => {
                Some(e)
            }
            UnbindReason::Unresolved(_) => None,
        }
    }
}
