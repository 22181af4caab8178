use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

#[cfg(target_os = "linux")]
use crate::net::errqueue;

/// The single OS socket owned by a connection.
#[derive(Debug)]
pub enum SocketHandle {
    Stream(TcpStream),
    Listener(TcpListener),
    Datagram(UdpSocket),
}

/// Outcome of probing a stream whose non-blocking connect is in flight.
#[derive(Debug)]
pub enum ConnectProgress {
    Pending,
    Connected(SocketAddr),
    Failed(io::Error),
}

/// A failure the OS queued for an earlier datagram send.
#[derive(Debug)]
pub struct QueuedError {
    pub error: io::Error,
    /// Where the failed datagram was going, when the OS says so.
    pub destination: Option<SocketAddr>,
}

impl SocketHandle {
    /// Starts a non-blocking connect. Errors here are immediate OS refusals.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        TcpStream::connect(addr).map(SocketHandle::Stream)
    }

    pub fn listen(addr: SocketAddr, backlog: i32) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            allow_dual_stack(&socket);
        }
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(backlog)?;
        socket.set_nonblocking(true)?;
        Ok(SocketHandle::Listener(TcpListener::from_std(socket.into())))
    }

    pub fn bind_datagram(addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if addr.is_ipv6() {
            allow_dual_stack(&socket);
        }
        #[cfg(target_os = "linux")]
        errqueue::enable(&socket, addr.is_ipv6())?;
        socket.bind(&SockAddr::from(addr))?;
        socket.set_nonblocking(true)?;
        Ok(SocketHandle::Datagram(UdpSocket::from_std(socket.into())))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            SocketHandle::Stream(s) => s.local_addr(),
            SocketHandle::Listener(l) => l.local_addr(),
            SocketHandle::Datagram(u) => u.local_addr(),
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.local_addr().map(|a| a.is_ipv6()).unwrap_or(false)
    }

    /// Takes the pending socket error (`SO_ERROR`), clearing it.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            SocketHandle::Stream(s) => s.take_error(),
            SocketHandle::Listener(l) => l.take_error(),
            SocketHandle::Datagram(u) => u.take_error(),
        }
    }

    /// Drains the errors queued for earlier datagram sends.
    ///
    /// Only Linux keeps such a queue; elsewhere this is always empty and late
    /// failures surface through [`SocketHandle::take_error`].
    pub fn drain_error_queue(&self) -> Vec<QueuedError> {
        match self {
            #[cfg(target_os = "linux")]
            SocketHandle::Datagram(u) => errqueue::drain(u),
            _ => Vec::new(),
        }
    }

    pub fn connect_progress(&self) -> ConnectProgress {
        let SocketHandle::Stream(stream) = self else {
            return ConnectProgress::Failed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a stream socket",
            ));
        };
        match stream.take_error() {
            Ok(Some(e)) | Err(e) => return ConnectProgress::Failed(e),
            Ok(None) => {}
        }
        match stream.peer_addr() {
            Ok(peer) => ConnectProgress::Connected(peer),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectProgress::Pending,
            Err(e) => ConnectProgress::Failed(e),
        }
    }

    pub fn set_nodelay(&self, enabled: bool) -> io::Result<()> {
        match self {
            SocketHandle::Stream(s) => s.set_nodelay(enabled),
            _ => Ok(()),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SocketHandle::Stream(s) => s.read(buf),
            _ => Err(unsupported("read")),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SocketHandle::Stream(s) => s.write(buf),
            _ => Err(unsupported("write")),
        }
    }

    pub fn accept(&self) -> io::Result<(SocketHandle, SocketAddr)> {
        match self {
            SocketHandle::Listener(l) => l
                .accept()
                .map(|(stream, peer)| (SocketHandle::Stream(stream), peer)),
            _ => Err(unsupported("accept")),
        }
    }

    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        match self {
            SocketHandle::Datagram(u) => u.send_to(buf, target),
            _ => Err(unsupported("send_to")),
        }
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self {
            SocketHandle::Datagram(u) => u.recv_from(buf),
            _ => Err(unsupported("recv_from")),
        }
    }
}

impl Source for SocketHandle {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            SocketHandle::Stream(s) => s.register(registry, token, interests),
            SocketHandle::Listener(l) => l.register(registry, token, interests),
            SocketHandle::Datagram(u) => u.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            SocketHandle::Stream(s) => s.reregister(registry, token, interests),
            SocketHandle::Listener(l) => l.reregister(registry, token, interests),
            SocketHandle::Datagram(u) => u.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            SocketHandle::Stream(s) => s.deregister(registry),
            SocketHandle::Listener(l) => l.deregister(registry),
            SocketHandle::Datagram(u) => u.deregister(registry),
        }
    }
}

// IPv6 sockets reach IPv4 peers through v4-mapped addresses.
fn allow_dual_stack(socket: &Socket) {
    if let Err(e) = socket.set_only_v6(false) {
        debug!(error = %e, "dual-stack not available, socket stays IPv6-only");
    }
}

fn unsupported(operation: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{operation} is not supported on this socket kind"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_datagram_reports_local_addr() {
        let socket = SocketHandle::bind_datagram("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = socket.local_addr().unwrap();
        assert!(local.port() != 0);
        assert!(!socket.is_ipv6());
    }

    #[test]
    fn test_listener_rejects_stream_ops() {
        let mut listener = SocketHandle::listen("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let err = listener.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        assert!(listener.take_error().unwrap().is_none());
    }

    #[test]
    fn test_connect_progress_on_refused_port() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let socket = match SocketHandle::connect(addr) {
            Ok(socket) => socket,
            // Some platforms refuse loopback connects synchronously.
            Err(_) => return,
        };
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            match socket.connect_progress() {
                ConnectProgress::Failed(_) => break,
                ConnectProgress::Pending if std::time::Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                other => panic!("expected refusal, got {:?}", other),
            }
        }
    }
}
