//! The single-threaded reactor.
//!
//! One call to [`Reactor::run`] drives everything: it runs the caller's body, then
//! loops until [`Reactor::stop`] is called or nothing is left to wait for.
//!
//! ```text
//!   run(body) ──> body(&mut Reactor) ──> teardowns
//!                                           │
//!        ┌──────────────────────────────────┘
//!        ▼
//!   clear transient error flags
//!        │
//!   poll(timeout = nearest timer | forever)
//!        │
//!   for each readiness event:  accept / connect-complete / read / flush
//!        │                      └─> handler hooks, then queued teardowns
//!   fire due timers (deadline order, ties by registration)
//!        │
//!   stop requested or no work left? ──no──> next cycle
//!        │yes
//!        ▼
//!   unbind every remaining connection
//! ```
//!
//! Handlers never see the reactor's internals directly. While a hook runs, its
//! handler is taken out of the registry and a [`Context`] lends the hook the
//! reactor. Closing a connection from inside any hook only queues the teardown; the
//! queue is drained after the hook returns. That keeps `unbind` from running while
//! another hook of the same connection is on the stack.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::result::Result as StdResult;
use std::time::{Duration, Instant};

use mio::Events;
use tracing::{debug, trace, warn};

use crate::config::ReactorConfig;
use crate::error::{Error, Result};
use crate::event::Readiness;
use crate::handler::{Context, Handler, HandlerFactory};
use crate::net::address::AddressResolver;
use crate::net::connection::{ConnectionId, ConnectionKind, ConnectionState, Datagram, Phase};
use crate::net::errors::{AsyncSocketError, ConnectionError, UnbindReason};
use crate::net::policy::{ErrorAction, ErrorHandlingPolicy};
use crate::net::socket::{ConnectProgress, SocketHandle};
use crate::poll::{PollHandle, StopHandle, WAKE_TOKEN};
use crate::timer::{Due, TimerHandle, TimerQueue};

enum TimerCallback {
    Once(Box<dyn FnOnce(&mut Reactor)>),
    Periodic(Box<dyn FnMut(&mut Reactor)>),
}

/// A listening TCP socket started with [`Reactor::start_server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHandle {
    id: ConnectionId,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The bound address, with the real port when port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

pub struct Reactor {
    poll_handle: PollHandle,
    events: Events,
    connections: HashMap<ConnectionId, ConnectionState>,
    timers: TimerQueue<TimerCallback>,
    teardowns: VecDeque<(ConnectionId, Option<UnbindReason>)>,
    flagged: Vec<ConnectionId>,
    resolver: AddressResolver,
    config: ReactorConfig,
    read_buf: Vec<u8>,
    next_id: u64,
    accepted: usize,
    stopping: bool,
    shutting_down: bool,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Result<Self> {
        Ok(Self {
            poll_handle: PollHandle::new().map_err(Error::Init)?,
            events: Events::with_capacity(config.events_capacity.max(1)),
            connections: HashMap::new(),
            timers: TimerQueue::new(),
            teardowns: VecDeque::new(),
            flagged: Vec::new(),
            resolver: AddressResolver::new(),
            read_buf: vec![0; config.read_buffer_size.max(1)],
            config,
            next_id: 1,
            accepted: 0,
            stopping: false,
            shutting_down: false,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(ReactorConfig::default())
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    /// Runs `body`, then the event loop until [`stop`](Self::stop) is called or no
    /// connections and timers remain. Returns whatever `body` returned.
    ///
    /// On exit every connection still registered is torn down and its `unbind`
    /// hook fires with no reason. Timers that have not fired stay queued for the
    /// next `run`.
    pub fn run<F, T>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Reactor) -> T,
    {
        self.stopping = false;
        let output = body(self);
        self.process_teardowns();
        let result = self.event_loop();
        self.shutdown();
        result.map(|()| output)
    }

    /// Ends the loop once the current callback returns.
    pub fn stop(&mut self) {
        self.stopping = true;
    }

    /// A `Send` handle that stops the loop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.poll_handle.stop_handle()
    }

    fn event_loop(&mut self) -> Result<()> {
        loop {
            if self.poll_handle.take_stop_request() {
                self.stopping = true;
            }
            if self.stopping {
                debug!("event loop stopped");
                return Ok(());
            }
            if self.connections.is_empty() && self.timers.is_empty() {
                debug!("event loop has no work left");
                return Ok(());
            }

            self.clear_error_flags();

            let timeout = self
                .timers
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if let Err(e) = self.poll_handle.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Poll(e));
            }

            let ready: Vec<Readiness> = self.events.iter().map(Readiness::from).collect();
            for readiness in ready {
                if self.stopping {
                    break;
                }
                if readiness.token() == WAKE_TOKEN {
                    if self.poll_handle.take_stop_request() {
                        self.stopping = true;
                    }
                    continue;
                }
                self.handle_readiness(readiness);
                self.process_teardowns();
            }

            self.fire_due_timers();
        }
    }

    fn shutdown(&mut self) {
        self.shutting_down = true;
        let mut remaining: Vec<ConnectionId> = self.connections.keys().copied().collect();
        remaining.sort();
        if !remaining.is_empty() {
            debug!(connections = remaining.len(), "closing remaining connections");
        }
        for id in remaining {
            self.schedule_teardown(id, None);
        }
        self.process_teardowns();
        self.flagged.clear();
        self.shutting_down = false;
    }

    // ---- timers ---------------------------------------------------------------

    /// Runs `callback` once, roughly `delay` from now.
    pub fn add_timer<F>(&mut self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce(&mut Reactor) + 'static,
    {
        self.timers.schedule(
            Instant::now() + delay,
            None,
            TimerCallback::Once(Box::new(callback)),
        )
    }

    /// Runs `callback` every `interval` until the timer is cancelled.
    pub fn add_periodic_timer<F>(&mut self, interval: Duration, callback: F) -> TimerHandle
    where
        F: FnMut(&mut Reactor) + 'static,
    {
        self.timers.schedule(
            Instant::now() + interval,
            Some(interval),
            TimerCallback::Periodic(Box::new(callback)),
        )
    }

    /// Returns `false` if the timer already fired or was cancelled.
    pub fn cancel_timer(&mut self, handle: TimerHandle) -> bool {
        self.timers.cancel(handle)
    }

    fn fire_due_timers(&mut self) {
        let mut due = self.timers.pop_due(Instant::now()).into_iter();
        while let Some(timer) = due.next() {
            if self.stopping {
                self.timers.restore(timer);
                for unfired in due.by_ref() {
                    self.timers.restore(unfired);
                }
                break;
            }
            // Cancelled by an earlier callback of this batch.
            if !self.timers.start_firing(&timer) {
                continue;
            }
            let Due {
                handle,
                interval,
                payload,
                ..
            } = timer;
            match payload {
                TimerCallback::Once(callback) => callback(self),
                TimerCallback::Periodic(mut callback) => {
                    callback(self);
                    if let Some(interval) = interval {
                        self.timers.rearm(
                            handle,
                            Instant::now(),
                            interval,
                            TimerCallback::Periodic(callback),
                        );
                    }
                }
            }
            self.process_teardowns();
        }
    }

    // ---- opening sockets ------------------------------------------------------

    /// Starts a non-blocking TCP connect.
    ///
    /// A malformed address fails right here and nothing is created. Every other
    /// failure (refused, unreachable, hostname without DNS) is reported through the
    /// handler's `unbind` with a reason.
    pub fn connect<H>(
        &mut self,
        address: &str,
        port: u16,
        handler: H,
    ) -> StdResult<ConnectionId, ConnectionError>
    where
        H: Handler,
    {
        self.ensure_accepting()?;
        let endpoint = self.resolver.resolve(address, port)?;
        let id = self.next_connection_id();

        let (socket, failure) = match endpoint.socket_addr() {
            None => (
                None,
                Some(UnbindReason::Unresolved(endpoint.address().to_owned())),
            ),
            Some(addr) => match SocketHandle::connect(addr) {
                Ok(socket) => (Some(socket), None),
                Err(e) => {
                    warn!(conn = %id, %addr, error = %e, "connect failed immediately");
                    (None, Some(UnbindReason::ConnectFailed(e.into())))
                }
            },
        };
        if let Some(socket) = &socket {
            if let Err(e) = socket.set_nodelay(self.config.no_delay) {
                debug!(conn = %id, error = %e, "failed to set TCP_NODELAY");
            }
        }

        let state = ConnectionState::new(id, ConnectionKind::TcpClient, socket, Phase::Connecting)
            .with_handler(Box::new(handler));
        self.insert(state)?;

        match failure {
            Some(reason) => self.schedule_teardown(id, Some(reason)),
            None => debug!(conn = %id, %endpoint, "connecting"),
        }
        Ok(id)
    }

    /// Listens on `address:port`; `factory` builds a handler for every accepted peer.
    pub fn start_server<F, H>(
        &mut self,
        address: &str,
        port: u16,
        mut factory: F,
    ) -> StdResult<ServerHandle, ConnectionError>
    where
        F: FnMut() -> H + 'static,
        H: Handler,
    {
        self.ensure_accepting()?;
        let endpoint = self.resolver.resolve(address, port)?;
        let addr = endpoint
            .socket_addr()
            .ok_or_else(|| ConnectionError::Unresolvable(address.to_owned()))?;
        let socket = SocketHandle::listen(addr, self.config.listen_backlog)?;
        let local_addr = socket.local_addr()?;

        let id = self.next_connection_id();
        let acceptor: HandlerFactory = Box::new(move || Box::new(factory()) as Box<dyn Handler>);
        let state = ConnectionState::new(id, ConnectionKind::TcpServer, Some(socket), Phase::Connected)
            .with_acceptor(acceptor);
        self.insert(state)?;

        debug!(server = %id, %local_addr, "listening");
        Ok(ServerHandle { id, local_addr })
    }

    /// Closes the listener. Connections it already accepted stay open.
    pub fn stop_server(&mut self, server: ServerHandle) {
        self.close_connection(server.id, false);
    }

    /// Binds a UDP socket. It is usable immediately; there is no connect phase.
    pub fn open_datagram_socket<H>(
        &mut self,
        address: &str,
        port: u16,
        handler: H,
    ) -> StdResult<ConnectionId, ConnectionError>
    where
        H: Handler,
    {
        self.ensure_accepting()?;
        let endpoint = self.resolver.resolve(address, port)?;
        let addr = endpoint
            .socket_addr()
            .ok_or_else(|| ConnectionError::Unresolvable(address.to_owned()))?;
        let socket = SocketHandle::bind_datagram(addr)?;
        let local_addr = socket.local_addr()?;

        let id = self.next_connection_id();
        let state = ConnectionState::new(id, ConnectionKind::Udp, Some(socket), Phase::Connected)
            .with_handler(Box::new(handler))
            .with_policy(self.config.send_error_handling);
        self.insert(state)?;

        debug!(conn = %id, %local_addr, "datagram socket open");
        Ok(id)
    }

    fn ensure_accepting(&self) -> StdResult<(), ConnectionError> {
        if self.shutting_down {
            return Err(ConnectionError::ShuttingDown);
        }
        Ok(())
    }

    fn next_connection_id(&mut self) -> ConnectionId {
        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert(&mut self, mut state: ConnectionState) -> StdResult<ConnectionId, ConnectionError> {
        let id = state.id;
        if let Some(interest) = state.desired_interest() {
            if let Some(socket) = state.socket.as_mut() {
                self.poll_handle.register(socket, id.token(), interest)?;
            }
            state.interest = Some(interest);
        }
        self.connections.insert(id, state);
        Ok(id)
    }

    // ---- sending and closing --------------------------------------------------

    /// Queues bytes on a stream. On a datagram socket, replies to the last sender.
    pub fn send_data(&mut self, id: ConnectionId, data: &[u8]) -> StdResult<(), ConnectionError> {
        let state = self
            .connections
            .get_mut(&id)
            .ok_or(ConnectionError::UnknownConnection(id))?;
        if !state.is_open() {
            return Err(ConnectionError::Closing(id));
        }
        if state.is_stream() {
            state.outbound.extend_from_slice(data);
        } else if state.kind == ConnectionKind::Udp {
            let peer = state.peer.ok_or(ConnectionError::Unsupported {
                id,
                operation: "send_data before any datagram arrived",
            })?;
            state.datagrams.push_back(Datagram {
                payload: data.to_vec(),
                target: peer,
                address: peer.ip().to_string(),
                port: peer.port(),
            });
        } else {
            return Err(ConnectionError::Unsupported {
                id,
                operation: "send_data",
            });
        }
        self.update_interest(id);
        Ok(())
    }

    /// Queues one datagram for `address:port`.
    ///
    /// The destination is resolved on every call; a malformed or hostname
    /// destination fails here. Delivery failures surface later through the
    /// socket's [`ErrorHandlingPolicy`].
    pub fn send_datagram(
        &mut self,
        id: ConnectionId,
        data: &[u8],
        address: &str,
        port: u16,
    ) -> StdResult<(), ConnectionError> {
        let endpoint = self.resolver.resolve(address, port)?;
        let state = self
            .connections
            .get_mut(&id)
            .ok_or(ConnectionError::UnknownConnection(id))?;
        if state.kind != ConnectionKind::Udp {
            return Err(ConnectionError::Unsupported {
                id,
                operation: "send_datagram",
            });
        }
        if !state.is_open() {
            return Err(ConnectionError::Closing(id));
        }
        let ipv6 = state.socket.as_ref().map_or(false, SocketHandle::is_ipv6);
        let target = endpoint
            .socket_addr_for(ipv6)
            .ok_or_else(|| ConnectionError::Unresolvable(address.to_owned()))?;

        trace!(conn = %id, %target, bytes = data.len(), "datagram queued");
        state.datagrams.push_back(Datagram {
            payload: data.to_vec(),
            target,
            address: address.to_owned(),
            port,
        });
        self.update_interest(id);
        Ok(())
    }

    /// Closes a connection. Idempotent: `unbind` fires once no matter how many times
    /// this is called. With `after_writing`, buffered output is flushed first.
    pub fn close_connection(&mut self, id: ConnectionId, after_writing: bool) {
        let Some(state) = self.connections.get_mut(&id) else {
            return;
        };
        if state.begin_close(after_writing) {
            self.schedule_teardown(id, None);
        } else if state.close_after_writing {
            debug!(conn = %id, pending = state.outbound_len(), "closing after writing");
        }
    }

    pub fn set_send_error_handling(
        &mut self,
        id: ConnectionId,
        policy: ErrorHandlingPolicy,
    ) -> StdResult<(), ConnectionError> {
        let state = self
            .connections
            .get_mut(&id)
            .ok_or(ConnectionError::UnknownConnection(id))?;
        if state.kind != ConnectionKind::Udp {
            return Err(ConnectionError::Unsupported {
                id,
                operation: "send_error_handling",
            });
        }
        state.policy = policy;
        Ok(())
    }

    // ---- queries --------------------------------------------------------------

    /// `Closed` for ids that are no longer (or never were) registered.
    pub fn phase(&self, id: ConnectionId) -> Phase {
        self.connections.get(&id).map_or(Phase::Closed, |s| s.phase)
    }

    /// True from the moment a reported async error is recorded until the start of
    /// the next readiness cycle.
    pub fn is_error(&self, id: ConnectionId) -> bool {
        self.connections.get(&id).map_or(false, |s| s.error_flag)
    }

    pub fn send_error_handling(&self, id: ConnectionId) -> Option<ErrorHandlingPolicy> {
        self.connections
            .get(&id)
            .filter(|s| s.kind == ConnectionKind::Udp)
            .map(|s| s.policy)
    }

    pub fn local_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections
            .get(&id)?
            .socket
            .as_ref()?
            .local_addr()
            .ok()
    }

    /// Stream peer, or the sender of the last datagram received.
    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(&id)?.peer
    }

    /// Bytes queued and not yet handed to the OS.
    pub fn outbound_len(&self, id: ConnectionId) -> usize {
        self.connections.get(&id).map_or(0, |s| s.outbound_len())
    }

    /// Live connections, listeners and datagram sockets.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ---- dispatch -------------------------------------------------------------

    fn dispatch<F>(&mut self, id: ConnectionId, f: F)
    where
        F: FnOnce(&mut dyn Handler, &mut Context<'_>),
    {
        let Some(mut handler) = self
            .connections
            .get_mut(&id)
            .and_then(|state| state.handler.take())
        else {
            return;
        };
        f(&mut *handler, &mut Context::new(self, id));
        if let Some(state) = self.connections.get_mut(&id) {
            state.handler = Some(handler);
        }
    }

    fn schedule_teardown(&mut self, id: ConnectionId, reason: Option<UnbindReason>) {
        let Some(state) = self.connections.get_mut(&id) else {
            return;
        };
        if state.mark_teardown() {
            self.teardowns.push_back((id, reason));
        }
    }

    fn process_teardowns(&mut self) {
        while let Some((id, reason)) = self.teardowns.pop_front() {
            let Some(mut state) = self.connections.remove(&id) else {
                continue;
            };
            if let Some(socket) = state.socket.as_mut() {
                if let Err(e) = self.poll_handle.deregister(socket) {
                    trace!(conn = %id, error = %e, "deregister failed");
                }
            }
            if state.kind == ConnectionKind::TcpAccepted {
                self.accepted = self.accepted.saturating_sub(1);
            }
            match &reason {
                Some(reason) => debug!(conn = %id, %reason, "unbind"),
                None => debug!(conn = %id, "unbind"),
            }
            if let Some(mut handler) = state.handler.take() {
                handler.unbind(&mut Context::new(self, id), reason.as_ref());
            }
            // The descriptor closes only after unbind has returned.
            drop(state);
        }
    }

    fn clear_error_flags(&mut self) {
        for id in self.flagged.drain(..) {
            if let Some(state) = self.connections.get_mut(&id) {
                state.error_flag = false;
            }
        }
    }

    fn update_interest(&mut self, id: ConnectionId) {
        let Some(state) = self.connections.get_mut(&id) else {
            return;
        };
        let desired = state.desired_interest();
        if desired == state.interest {
            return;
        }
        let (Some(interest), Some(socket)) = (desired, state.socket.as_mut()) else {
            return;
        };
        let result = if state.interest.is_some() {
            self.poll_handle.reregister(socket, id.token(), interest)
        } else {
            self.poll_handle.register(socket, id.token(), interest)
        };
        match result {
            Ok(()) => state.interest = Some(interest),
            Err(e) => {
                warn!(conn = %id, error = %e, "failed to update interest");
                self.schedule_teardown(id, Some(UnbindReason::Io(e.into())));
            }
        }
    }

    // ---- readiness ------------------------------------------------------------

    fn handle_readiness(&mut self, readiness: Readiness) {
        let id = ConnectionId::from_token(readiness.token());
        let Some(state) = self.connections.get(&id) else {
            return;
        };
        trace!(conn = %id, ?readiness, "ready");
        match (state.kind, state.phase) {
            (ConnectionKind::TcpServer, _) => self.accept_ready(id),
            (ConnectionKind::Udp, _) => self.datagram_ready(id, readiness),
            (ConnectionKind::TcpClient, Phase::Connecting) => {
                if self.complete_connect(id) {
                    self.stream_ready(id, readiness);
                }
            }
            _ => self.stream_ready(id, readiness),
        }
        self.update_interest(id);
    }

    fn accept_ready(&mut self, id: ConnectionId) {
        loop {
            if self.stopping {
                break;
            }
            let Some(state) = self.connections.get(&id) else {
                break;
            };
            if state.phase != Phase::Connected {
                break;
            }
            let Some(listener) = state.socket.as_ref() else {
                break;
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Some(max) = self.config.max_connections {
                        if self.accepted >= max {
                            warn!(server = %id, %peer, "max connections reached, rejecting");
                            continue;
                        }
                    }
                    if let Err(e) = stream.set_nodelay(self.config.no_delay) {
                        debug!(server = %id, error = %e, "failed to set TCP_NODELAY");
                    }
                    let Some(handler) = self
                        .connections
                        .get_mut(&id)
                        .and_then(|s| s.acceptor.as_mut())
                        .map(|factory| factory())
                    else {
                        break;
                    };
                    let conn_id = self.next_connection_id();
                    let mut conn = ConnectionState::new(
                        conn_id,
                        ConnectionKind::TcpAccepted,
                        Some(stream),
                        Phase::Connected,
                    )
                    .with_handler(handler);
                    conn.peer = Some(peer);
                    match self.insert(conn) {
                        Ok(_) => {
                            self.accepted += 1;
                            debug!(server = %id, conn = %conn_id, %peer, "accepted");
                        }
                        Err(e) => warn!(server = %id, %peer, error = %e, "failed to register peer"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(server = %id, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Returns `true` once the connection is established and not being torn down.
    fn complete_connect(&mut self, id: ConnectionId) -> bool {
        let Some(state) = self.connections.get_mut(&id) else {
            return false;
        };
        let Some(socket) = state.socket.as_ref() else {
            return false;
        };
        match socket.connect_progress() {
            ConnectProgress::Pending => false,
            ConnectProgress::Failed(e) => {
                warn!(conn = %id, error = %e, "connect failed");
                self.schedule_teardown(id, Some(UnbindReason::ConnectFailed(e.into())));
                false
            }
            ConnectProgress::Connected(peer) => {
                state.phase = Phase::Connected;
                state.peer = Some(peer);
                debug!(conn = %id, %peer, "connection completed");
                self.dispatch(id, |handler, ctx| handler.connection_completed(ctx));
                self.connections
                    .get(&id)
                    .map_or(false, |state| !state.teardown_queued)
            }
        }
    }

    fn stream_ready(&mut self, id: ConnectionId, readiness: Readiness) {
        if readiness.is_error() {
            if let Some(e) = self.take_socket_error(id) {
                self.fail_stream(id, e);
                return;
            }
        }
        if readiness.is_readable() || readiness.is_read_closed() {
            self.read_stream(id);
        }
        if readiness.is_writable() {
            self.flush_stream(id);
        }
    }

    fn take_socket_error(&self, id: ConnectionId) -> Option<io::Error> {
        let socket = self.connections.get(&id)?.socket.as_ref()?;
        match socket.take_error() {
            Ok(error) => error,
            Err(e) => Some(e),
        }
    }

    fn fail_stream(&mut self, id: ConnectionId, error: io::Error) {
        warn!(conn = %id, %error, "stream error");
        self.schedule_teardown(id, Some(UnbindReason::Io(error.into())));
    }

    fn read_stream(&mut self, id: ConnectionId) {
        let mut buf = std::mem::take(&mut self.read_buf);
        loop {
            if self.stopping {
                break;
            }
            let Some(state) = self.connections.get_mut(&id) else {
                break;
            };
            if state.phase != Phase::Connected {
                break;
            }
            let Some(socket) = state.socket.as_mut() else {
                break;
            };
            match socket.read(&mut buf) {
                Ok(0) => {
                    debug!(conn = %id, "peer closed the connection");
                    self.schedule_teardown(id, None);
                    break;
                }
                Ok(n) => {
                    trace!(conn = %id, bytes = n, "read");
                    self.dispatch(id, |handler, ctx| handler.receive_data(ctx, &buf[..n]));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail_stream(id, e);
                    break;
                }
            }
        }
        self.read_buf = buf;
    }

    fn flush_stream(&mut self, id: ConnectionId) {
        let Some(state) = self.connections.get_mut(&id) else {
            return;
        };
        if state.teardown_queued || !matches!(state.phase, Phase::Connected | Phase::Closing) {
            return;
        }
        let Some(socket) = state.socket.as_mut() else {
            return;
        };
        let mut failure = None;
        while !state.outbound.is_empty() {
            match socket.write(&state.outbound) {
                Ok(0) => {
                    failure = Some(io::Error::from(io::ErrorKind::WriteZero));
                    break;
                }
                Ok(n) => {
                    trace!(conn = %id, bytes = n, "wrote");
                    state.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let drained = state.finish_draining();
        if let Some(e) = failure {
            self.fail_stream(id, e);
        } else if drained {
            self.schedule_teardown(id, None);
        }
    }

    fn datagram_ready(&mut self, id: ConnectionId, readiness: Readiness) {
        if readiness.is_error() && !self.drain_error_queue(id) {
            if let Some(e) = self.take_socket_error(id) {
                self.record_async_error(id, e.into());
            }
        }
        if readiness.is_readable() {
            self.read_datagrams(id);
        }
        if readiness.is_writable() {
            self.flush_datagrams(id);
        }
        self.deliver_async_errors(id);
    }

    fn record_async_error(&mut self, id: ConnectionId, error: AsyncSocketError) {
        if let Some(state) = self.connections.get_mut(&id) {
            debug!(conn = %id, %error, "async socket error");
            state.pending_errors.push_back(error);
        }
    }

    /// Moves failures the OS queued for earlier sends onto the connection.
    /// Returns whether there were any.
    fn drain_error_queue(&mut self, id: ConnectionId) -> bool {
        let Some(socket) = self.connections.get(&id).and_then(|s| s.socket.as_ref()) else {
            return false;
        };
        let queued = socket.drain_error_queue();
        let found = !queued.is_empty();
        for failure in queued {
            self.record_async_error(id, failure.into());
        }
        found
    }

    fn read_datagrams(&mut self, id: ConnectionId) {
        let mut buf = std::mem::take(&mut self.read_buf);
        loop {
            if self.stopping {
                break;
            }
            let Some(state) = self.connections.get_mut(&id) else {
                break;
            };
            if state.phase != Phase::Connected {
                break;
            }
            let Some(socket) = state.socket.as_ref() else {
                break;
            };
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    trace!(conn = %id, bytes = n, %from, "datagram received");
                    state.peer = Some(from);
                    self.dispatch(id, |handler, ctx| handler.receive_data(ctx, &buf[..n]));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // The queued entry names the destination, the bare error does not.
                    if !self.drain_error_queue(id) {
                        self.record_async_error(id, e.into());
                    }
                    break;
                }
            }
        }
        self.read_buf = buf;
    }

    fn flush_datagrams(&mut self, id: ConnectionId) {
        let Some(state) = self.connections.get_mut(&id) else {
            return;
        };
        if state.teardown_queued {
            return;
        }
        let Some(socket) = state.socket.as_ref() else {
            return;
        };
        while let Some(datagram) = state.datagrams.front() {
            match socket.send_to(&datagram.payload, datagram.target) {
                Ok(n) => {
                    trace!(conn = %id, bytes = n, target = %datagram.target, "datagram sent");
                    state.datagrams.pop_front();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let stale = socket.drain_error_queue();
                    if !stale.is_empty() {
                        // The failure belonged to an earlier datagram; retry this one.
                        state
                            .pending_errors
                            .extend(stale.into_iter().map(AsyncSocketError::from));
                        continue;
                    }
                    let error = AsyncSocketError::new(&e)
                        .with_destination(datagram.address.clone(), datagram.port);
                    debug!(conn = %id, target = %datagram.target, %error, "datagram send failed");
                    state.pending_errors.push_back(error);
                    state.datagrams.pop_front();
                }
            }
        }
        if state.finish_draining() {
            self.schedule_teardown(id, None);
        }
    }

    /// Applies the socket's policy to each queued async error, in arrival order.
    fn deliver_async_errors(&mut self, id: ConnectionId) {
        loop {
            if self.stopping {
                return;
            }
            let Some(state) = self.connections.get_mut(&id) else {
                return;
            };
            if state.teardown_queued {
                state.pending_errors.clear();
                return;
            }
            let Some(error) = state.pending_errors.pop_front() else {
                return;
            };
            let policy = state.policy;
            if policy.flags_errors() && !state.error_flag {
                state.error_flag = true;
                self.flagged.push(id);
            }
            match policy.classify(error) {
                ErrorAction::Discard => trace!(conn = %id, "async socket error ignored"),
                ErrorAction::TearDown(reason) => {
                    self.schedule_teardown(id, Some(reason));
                    return;
                }
                ErrorAction::Report(error) => {
                    self.dispatch(id, |handler, ctx| handler.receive_senderror(ctx, &error));
                }
            }
        }
    }
}
