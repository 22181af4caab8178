//! # Mill-Reactor
//! A single-threaded, callback-driven event reactor for TCP and UDP on top of [`mio`].
//!
//! Every connection, listener and datagram socket belongs to one [`Reactor`] and is
//! driven by a [`Handler`]: a set of lifecycle hooks the reactor calls as readiness
//! arrives. Callbacks never run concurrently, so handlers need no locking.
//!
//! ## Features
//! - **Dual-stack addressing**: IPv4 and IPv6 literals are classified and validated
//!   up front; malformed addresses fail synchronously, hostnames fail through `unbind`
//! - **Connection lifecycle**: `Connecting -> Connected -> Closing -> Closed` with
//!   exactly one `unbind` per connection
//! - **Async send errors**: per-socket [`ErrorHandlingPolicy`] (`Ignore`, `Drop`,
//!   `Report`) decides what a failed datagram delivery does
//! - **Timers**: one-shot and periodic, fired in deadline order
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
//! │ EventLoop   │───▶│   Reactor    │───▶│ PollHandle  │
//! └─────────────┘    └──────────────┘    └─────────────┘
//!                       │        │
//!                       ▼        ▼
//!              ┌────────────┐  ┌────────────┐
//!              │ Connection │  │ TimerQueue │
//!              │  registry  │  └────────────┘
//!              └────────────┘
//!                    │ hooks (Context)
//!                    ▼
//!              ┌────────────┐
//!              │  Handler   │
//!              └────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_reactor::{Context, EventLoop, Handler};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn receive_data(&mut self, ctx: &mut Context<'_>, data: &[u8]) {
//!         let _ = ctx.send_data(data);
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut event_loop = EventLoop::with_defaults()?;
//!     event_loop.run(|reactor| reactor.start_server("::1", 8080, || Echo))??;
//!     Ok(())
//! }
//! ```
//!
//! - [`EventLoop`]: entry point owning one reactor
//! - [`Handler`] and [`Context`]: per-connection hooks and the reactor view they get
//! - [`reactor`]: the poll loop, connection registry and timers
//! - [`net`]: address classification, socket plumbing and send-error policies
//! - [`config`]: [`ReactorConfig`] and its builder
//! - [`error`]: crate-level errors

pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod net;
pub mod poll;
pub mod reactor;
pub mod timer;

pub use config::ReactorConfig;
pub use handler::{Context, Handler, NoOpHandler};
pub use net::address::{AddressError, AddressFamily, Endpoint};
pub use net::connection::{ConnectionId, ConnectionKind, Phase};
pub use net::errors::{AsyncSocketError, ConnectionError, UnbindReason};
pub use net::policy::ErrorHandlingPolicy;
pub use poll::StopHandle;
pub use reactor::{Reactor, ServerHandle};
pub use timer::TimerHandle;

use crate::error::Result;

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use mill_reactor::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::ReactorConfig;
    pub use crate::handler::{Context, Handler, NoOpHandler};
    pub use crate::net::connection::{ConnectionId, Phase};
    pub use crate::net::errors::{AsyncSocketError, ConnectionError, UnbindReason};
    pub use crate::net::policy::ErrorHandlingPolicy;
    pub use crate::reactor::{self, Reactor, ServerHandle};
    pub use crate::EventLoop;
}

/// The main event loop: one reactor and the thread that runs it.
///
/// `EventLoop` owns a [`Reactor`]. Sockets and timers are set up inside the body
/// passed to [`run`](Self::run), or from any handler hook through its [`Context`].
///
/// ## Example
///
/// ```rust,no_run
/// use mill_reactor::{EventLoop, ReactorConfig, ErrorHandlingPolicy};
/// use std::time::Duration;
///
/// let config = ReactorConfig::builder()
///     .send_error_handling(ErrorHandlingPolicy::Report)
///     .build();
/// let mut event_loop = EventLoop::new(config)?;
/// event_loop.run(|reactor| {
///     reactor.add_timer(Duration::from_secs(1), |reactor| reactor.stop());
/// })?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct EventLoop {
    reactor: Reactor,
}

impl EventLoop {
    /// Creates an event loop with the given configuration.
    ///
    /// ## Errors
    ///
    /// Returns [`error::Error::Init`] if the OS poller cannot be created.
    pub fn new(config: ReactorConfig) -> Result<Self> {
        Ok(Self {
            reactor: Reactor::new(config)?,
        })
    }

    /// Creates an event loop with [`ReactorConfig::default`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ReactorConfig::default())
    }

    /// Runs `body`, then dispatches events until the reactor is stopped or has
    /// nothing left to do. Blocks the calling thread.
    ///
    /// ## Errors
    ///
    /// Returns [`error::Error::Poll`] if the OS poller fails. Connections still open
    /// are unbound before the error is returned.
    pub fn run<F, T>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Reactor) -> T,
    {
        self.reactor.run(body)
    }

    /// A thread-safe handle that stops a running loop.
    ///
    /// ```rust,no_run
    /// use mill_reactor::EventLoop;
    /// use std::{thread, time::Duration};
    ///
    /// let mut event_loop = EventLoop::with_defaults()?;
    /// let stop = event_loop.stop_handle();
    /// thread::spawn(move || {
    ///     thread::sleep(Duration::from_secs(1));
    ///     let _ = stop.stop();
    /// });
    /// event_loop.run(|reactor| {
    ///     reactor.add_periodic_timer(Duration::from_millis(100), |_| {});
    /// })?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn stop_handle(&self) -> StopHandle {
        self.reactor.stop_handle()
    }

    /// The underlying reactor, for queries between runs.
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Mutable access to the underlying reactor outside of [`EventLoop::run`].
    pub fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }
}
