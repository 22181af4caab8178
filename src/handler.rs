use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};

use crate::net::connection::{ConnectionId, Phase};
use crate::net::errors::{AsyncSocketError, ConnectionError, UnbindReason};
use crate::net::policy::ErrorHandlingPolicy;
use crate::reactor::Reactor;

/// Lifecycle hooks for one connection.
///
/// Every hook has a default that does nothing, so a handler implements only what
/// it needs. Hooks run on the reactor thread, one at a time, and receive a
/// [`Context`] bound to the connection they belong to.
///
/// ## Ordering
///
/// For a TCP client, `connection_completed` fires once before any `receive_data`.
/// `unbind` fires at most once and is always the last hook a connection sees.
pub trait Handler: 'static {
    /// The non-blocking connect of a TCP client succeeded.
    fn connection_completed(&mut self, ctx: &mut Context<'_>) {
        let _ = ctx;
    }

    /// A chunk of stream data, or one whole datagram, arrived.
    fn receive_data(&mut self, ctx: &mut Context<'_>, data: &[u8]) {
        let _ = (ctx, data);
    }

    /// An async send error on a datagram socket whose policy is `Report`.
    fn receive_senderror(&mut self, ctx: &mut Context<'_>, error: &AsyncSocketError) {
        let _ = (ctx, error);
    }

    /// The connection is being torn down. `reason` is `None` for a clean close.
    fn unbind(&mut self, ctx: &mut Context<'_>, reason: Option<&UnbindReason>) {
        let _ = (ctx, reason);
    }
}

/// Builds one handler per accepted peer.
pub type HandlerFactory = Box<dyn FnMut() -> Box<dyn Handler>>;

/// A handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl Handler for NoOpHandler {}

/// The view of the reactor a hook receives.
///
/// It dereferences to [`Reactor`], so any reactor operation (`connect`, `add_timer`,
/// `stop`, ...) is available. The methods below act on the hook's own connection.
pub struct Context<'a> {
    reactor: &'a mut Reactor,
    id: ConnectionId,
}

impl<'a> Context<'a> {
    pub(crate) fn new(reactor: &'a mut Reactor, id: ConnectionId) -> Self {
        Self { reactor, id }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send_data(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.reactor.send_data(self.id, data)
    }

    pub fn send_datagram(
        &mut self,
        data: &[u8],
        address: &str,
        port: u16,
    ) -> Result<(), ConnectionError> {
        self.reactor.send_datagram(self.id, data, address, port)
    }

    pub fn close_connection(&mut self, after_writing: bool) {
        self.reactor.close_connection(self.id, after_writing)
    }

    /// True while an async error reported for this connection is still current.
    pub fn is_error(&self) -> bool {
        self.reactor.is_error(self.id)
    }

    pub fn phase(&self) -> Phase {
        self.reactor.phase(self.id)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.reactor.peer_addr(self.id)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.reactor.local_addr(self.id)
    }

    pub fn set_send_error_handling(
        &mut self,
        policy: ErrorHandlingPolicy,
    ) -> Result<(), ConnectionError> {
        self.reactor.set_send_error_handling(self.id, policy)
    }
}

impl Deref for Context<'_> {
    type Target = Reactor;

    fn deref(&self) -> &Reactor {
        self.reactor
    }
}

impl DerefMut for Context<'_> {
    fn deref_mut(&mut self) -> &mut Reactor {
        self.reactor
    }
}
