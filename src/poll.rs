use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

/// Token reserved for the cross-thread waker. Connection ids start at 1.
pub const WAKE_TOKEN: Token = Token(0);

/// Owns the OS poller and the waker used to interrupt it.
pub struct PollHandle {
    poller: Poll,
    waker: Arc<Waker>,
    stop_requested: Arc<AtomicBool>,
}

impl PollHandle {
    pub fn new() -> io::Result<Self> {
        let poller = Poll::new()?;
        let waker = Waker::new(poller.registry(), WAKE_TOKEN)?;
        Ok(PollHandle {
            poller,
            waker: Arc::new(waker),
            stop_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn register<S>(&self, src: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        src.register(self.poller.registry(), token, interest)
    }

    pub fn reregister<S>(&self, src: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        src.reregister(self.poller.registry(), token, interest)
    }

    pub fn deregister<S>(&self, src: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        src.deregister(self.poller.registry())
    }

    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        self.poller.poll(events, timeout)?;
        Ok(events.iter().count())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            waker: Arc::clone(&self.waker),
            stop_requested: Arc::clone(&self.stop_requested),
        }
    }

    /// Consumes a pending cross-thread stop request.
    pub fn take_stop_request(&self) -> bool {
        self.stop_requested.swap(false, Ordering::SeqCst)
    }
}

/// Stops a running event loop from any thread.
///
/// The loop exits after the callback it is currently running, if any, returns.
#[derive(Clone)]
pub struct StopHandle {
    waker: Arc<Waker>,
    stop_requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) -> io::Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.waker.wake()
    }
}
