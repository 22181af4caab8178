#![allow(unsafe_code)]
//! Linux socket error queue for datagram sockets.
//!
//! An unconnected UDP socket only hears about ICMP failures (port or host
//! unreachable) when `IP_RECVERR` / `IPV6_RECVERR` is set. The kernel then queues
//! one entry per failure, readable with `recvmsg(MSG_ERRQUEUE)`. Each entry carries
//! a `sock_extended_err` control message and, in `msg_name`, the destination of
//! the datagram that failed. A non-empty queue shows up as `EPOLLERR`.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

use tracing::debug;

use crate::net::socket::QueuedError;

/// Turns on error queueing for a freshly created datagram socket.
pub(crate) fn enable(socket: &impl AsRawFd, ipv6: bool) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    if !ipv6 {
        return set_flag(fd, libc::IPPROTO_IP, libc::IP_RECVERR);
    }
    set_flag(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVERR)?;
    // v4-mapped traffic on a dual-stack socket is governed by the IPv4 option.
    if let Err(e) = set_flag(fd, libc::IPPROTO_IP, libc::IP_RECVERR) {
        debug!(error = %e, "IP_RECVERR unavailable on IPv6 socket");
    }
    Ok(())
}

/// Reads every queued entry until the queue is empty.
pub(crate) fn drain(socket: &impl AsRawFd) -> Vec<QueuedError> {
    let fd = socket.as_raw_fd();
    let mut drained = Vec::new();
    loop {
        match recv_one(fd) {
            Ok(Entry::Failure(queued)) => drained.push(queued),
            Ok(Entry::Other) => continue,
            Ok(Entry::Empty) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "reading the socket error queue failed");
                break;
            }
        }
    }
    drained
}

fn set_flag(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<()> {
    let on: libc::c_int = 1;
    // SAFETY: `on` outlives the call and its exact size is passed with it.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&on as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

enum Entry {
    Empty,
    Failure(QueuedError),
    /// Not an IP error (timestamps, zerocopy completions).
    Other,
}

fn recv_one(fd: RawFd) -> io::Result<Entry> {
    // SAFETY: all-zero is a valid bit pattern for these plain C structs.
    let mut name: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    // The payload echoed back with the error is not needed.
    let mut payload = [0u8; 64];
    // u64 keeps the control buffer aligned for cmsghdr.
    let mut control = [0u64; 64];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };

    msg.msg_name = (&mut name as *mut libc::sockaddr_storage).cast();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of_val(&control) as _;

    // SAFETY: every pointer in `msg` refers to a live local buffer of the stated size.
    let rc = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
    if rc == -1 {
        let e = io::Error::last_os_error();
        if e.kind() == io::ErrorKind::WouldBlock {
            return Ok(Entry::Empty);
        }
        return Err(e);
    }

    let mut errno = None;
    // SAFETY: the kernel filled `control` with `msg_controllen` bytes of cmsgs, and
    // the CMSG_* helpers never step past that length.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let level = (*cmsg).cmsg_level;
            let kind = (*cmsg).cmsg_type;
            let extended = (level == libc::IPPROTO_IP && kind == libc::IP_RECVERR)
                || (level == libc::IPPROTO_IPV6 && kind == libc::IPV6_RECVERR);
            if extended {
                let ee = libc::CMSG_DATA(cmsg)
                    .cast::<libc::sock_extended_err>()
                    .read_unaligned();
                errno = Some(ee.ee_errno as i32);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    let Some(errno) = errno else {
        return Ok(Entry::Other);
    };
    Ok(Entry::Failure(QueuedError {
        error: io::Error::from_raw_os_error(errno),
        destination: destination(&name, msg.msg_namelen),
    }))
}

/// Decodes the `msg_name` of an error entry, unmapping v4-mapped addresses.
fn destination(name: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
    let len = len as usize;
    match name.ss_family as libc::c_int {
        libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
            // SAFETY: the family and length say the storage holds a sockaddr_in.
            let sin = unsafe { &*(name as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
            // SAFETY: the family and length say the storage holds a sockaddr_in6.
            let sin6 = unsafe { &*(name as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let ip = ip.to_ipv4_mapped().map_or(IpAddr::V6(ip), IpAddr::V4);
            Some(SocketAddr::new(ip, u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}
