//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Once;
use std::time::Duration;

use mill_reactor::{AsyncSocketError, Context, Handler, Reactor, TimerHandle, UnbindReason};
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Upper bound for any single test run; the guard timer stops the loop after it.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize test logging. `RUST_LOG` overrides the default filter.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mill_reactor=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Whether the host has a usable IPv6 loopback.
pub fn ipv6_available() -> bool {
    std::net::UdpSocket::bind("[::1]:0").is_ok()
}

/// Stops the reactor after [`TEST_TIMEOUT`] and records that it had to.
pub fn arm_guard(reactor: &mut Reactor, timed_out: &Rc<Cell<bool>>) -> TimerHandle {
    let timed_out = timed_out.clone();
    reactor.add_timer(TEST_TIMEOUT, move |reactor| {
        timed_out.set(true);
        reactor.stop();
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Completed,
    Data(Vec<u8>),
    SendError(AsyncSocketError),
    Unbind(Option<UnbindReason>),
}

/// Shared, ordered record of the hooks a handler saw.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Rc<RefCell<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().clone()
    }

    /// Every `Data` payload, concatenated.
    pub fn data(&self) -> Vec<u8> {
        self.0
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Data(bytes) => Some(bytes.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    pub fn unbinds(&self) -> Vec<Option<UnbindReason>> {
        self.0
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Unbind(reason) => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn send_errors(&self) -> Vec<AsyncSocketError> {
        self.0
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::SendError(error) => Some(error.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Records every hook and otherwise does nothing.
pub struct Recorder {
    pub log: EventLog,
    stop_on_unbind: bool,
}

impl Recorder {
    pub fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            stop_on_unbind: false,
        }
    }

    /// A recorder whose `unbind` also stops the reactor.
    pub fn stopping(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            stop_on_unbind: true,
        }
    }
}

impl Handler for Recorder {
    fn connection_completed(&mut self, _ctx: &mut Context<'_>) {
        self.log.push(Event::Completed);
    }

    fn receive_data(&mut self, _ctx: &mut Context<'_>, data: &[u8]) {
        self.log.push(Event::Data(data.to_vec()));
    }

    fn receive_senderror(&mut self, _ctx: &mut Context<'_>, error: &AsyncSocketError) {
        self.log.push(Event::SendError(error.clone()));
    }

    fn unbind(&mut self, ctx: &mut Context<'_>, reason: Option<&UnbindReason>) {
        self.log.push(Event::Unbind(reason.cloned()));
        if self.stop_on_unbind {
            ctx.stop();
        }
    }
}

/// Echoes every chunk back to its sender.
pub struct Echo;

impl Handler for Echo {
    fn receive_data(&mut self, ctx: &mut Context<'_>, data: &[u8]) {
        let _ = ctx.send_data(data);
    }
}
