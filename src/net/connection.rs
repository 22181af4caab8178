//! Per-socket lifecycle state.
//!
//! ```text
//!   connect()            ──> Connecting ──(connect ok)────> Connected
//!                                │                            │
//!                   (refused, unresolved)       (EOF, close, fatal error,
//!                                │                Drop-policy send error)
//!                                ▼                            ▼
//!                             Closing <───────────────────────┘
//!                                │
//!                         (unbind fired)
//!                                ▼
//!                              Closed
//!
//!   accept() / open_datagram_socket() ──> Connected
//! ```
//!
//! The reactor owns every `ConnectionState` and is the only code that moves it
//! between phases.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;

use mio::{Interest, Token};

use crate::handler::{Handler, HandlerFactory};
use crate::net::errors::AsyncSocketError;
use crate::net::policy::ErrorHandlingPolicy;
use crate::net::socket::SocketHandle;

/// Unique identifier for connections, servers and datagram sockets.
///
/// Identifiers are never reused within one reactor, so a stale id simply stops
/// resolving once its connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.0 as usize)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        ConnectionId(token.0 as u64)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    TcpClient,
    TcpServer,
    TcpAccepted,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// A datagram waiting for write readiness.
#[derive(Debug)]
pub(crate) struct Datagram {
    pub payload: Vec<u8>,
    pub target: SocketAddr,
    pub address: String,
    pub port: u16,
}

pub(crate) struct ConnectionState {
    pub id: ConnectionId,
    pub kind: ConnectionKind,
    pub socket: Option<SocketHandle>,
    pub phase: Phase,
    pub handler: Option<Box<dyn Handler>>,
    pub acceptor: Option<HandlerFactory>,
    pub policy: ErrorHandlingPolicy,
    pub pending_errors: VecDeque<AsyncSocketError>,
    pub error_flag: bool,
    pub outbound: Vec<u8>,
    pub datagrams: VecDeque<Datagram>,
    pub close_after_writing: bool,
    pub teardown_queued: bool,
    pub interest: Option<Interest>,
    pub peer: Option<SocketAddr>,
}

impl ConnectionState {
    pub fn new(
        id: ConnectionId,
        kind: ConnectionKind,
        socket: Option<SocketHandle>,
        phase: Phase,
    ) -> Self {
        Self {
            id,
            kind,
            socket,
            phase,
            handler: None,
            acceptor: None,
            policy: ErrorHandlingPolicy::default(),
            pending_errors: VecDeque::new(),
            error_flag: false,
            outbound: Vec::new(),
            datagrams: VecDeque::new(),
            close_after_writing: false,
            teardown_queued: false,
            interest: None,
            peer: None,
        }
    }

    pub fn with_handler(mut self, handler: Box<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_acceptor(mut self, acceptor: HandlerFactory) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn with_policy(mut self, policy: ErrorHandlingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.kind, ConnectionKind::TcpClient | ConnectionKind::TcpAccepted)
    }

    pub fn is_open(&self) -> bool {
        matches!(self.phase, Phase::Connecting | Phase::Connected)
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty() || !self.datagrams.is_empty()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len() + self.datagrams.iter().map(|d| d.payload.len()).sum::<usize>()
    }

    /// Interest the socket should be registered with in its current phase.
    pub fn desired_interest(&self) -> Option<Interest> {
        self.socket.as_ref()?;
        let interest = match (self.kind, self.phase) {
            (_, Phase::Closed) => return None,
            (ConnectionKind::TcpServer, _) => Interest::READABLE,
            (_, Phase::Connecting) => Interest::READABLE | Interest::WRITABLE,
            _ if self.has_pending_output() => Interest::READABLE | Interest::WRITABLE,
            _ => Interest::READABLE,
        };
        Some(interest)
    }

    /// Starts a local close.
    ///
    /// Returns `true` when the teardown must be queued now. Returns `false` when the
    /// connection is already closing, or when the close waits for the outbound
    /// buffer to drain.
    pub fn begin_close(&mut self, after_writing: bool) -> bool {
        if !self.is_open() {
            return false;
        }
        if after_writing && self.phase == Phase::Connected && self.has_pending_output() {
            self.phase = Phase::Closing;
            self.close_after_writing = true;
            return false;
        }
        true
    }

    /// Marks the connection for teardown. Returns `false` if it already was.
    pub fn mark_teardown(&mut self) -> bool {
        if self.teardown_queued {
            return false;
        }
        self.teardown_queued = true;
        self.phase = Phase::Closing;
        self.close_after_writing = false;
        self.outbound.clear();
        self.datagrams.clear();
        true
    }

    /// True once a deferred close has nothing left to write.
    pub fn finish_draining(&mut self) -> bool {
        if self.phase == Phase::Closing && self.close_after_writing && !self.has_pending_output() {
            self.close_after_writing = false;
            return true;
        }
        false
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("phase", &self.phase)
            .field("policy", &self.policy)
            .field("pending_errors", &self.pending_errors.len())
            .field("error_flag", &self.error_flag)
            .field("outbound", &self.outbound_len())
            .finish()
    }
}
