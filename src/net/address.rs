//! Literal address parsing and classification.
//!
//! The resolver never touches the network. An address is classified purely by its
//! syntactic form:
//!
//! ```text
//!   "[::1]", "fe80::1%2", "::ffff:1.2.3.4"   ──> Ipv6       (contains ':')
//!   "127.0.0.1"                              ──> Ipv4       (digits and dots)
//!   "example.com"                            ──> Unresolved (RFC 1123 hostname)
//!   "1:A", "256.0.0.1", "bad_host!", ""      ──> AddressError::Malformed
//! ```
//!
//! Hostnames are accepted as valid input but stay [`AddressFamily::Unresolved`]:
//! looking them up would block the reactor thread.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

use thiserror::Error;

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Address family derived from the textual form of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    /// A syntactically valid hostname that has not been looked up.
    Unresolved,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => f.write_str("IPv4"),
            AddressFamily::Ipv6 => f.write_str("IPv6"),
            AddressFamily::Unresolved => f.write_str("unresolved"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddressErrorKind {
    Malformed,
}

impl fmt::Display for AddressErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressErrorKind::Malformed => f.write_str("malformed"),
        }
    }
}

/// A syntactically invalid address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} address {address:?}: {reason}")]
pub struct AddressError {
    kind: AddressErrorKind,
    address: String,
    reason: &'static str,
}

impl AddressError {
    fn malformed(address: &str, reason: &'static str) -> Self {
        Self {
            kind: AddressErrorKind::Malformed,
            address: address.to_owned(),
            reason,
        }
    }

    pub fn kind(&self) -> AddressErrorKind {
        self.kind
    }

    /// The rejected input, verbatim.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

/// An address + port pair classified by [`AddressResolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    address: String,
    port: u16,
    family: AddressFamily,
    socket_addr: Option<SocketAddr>,
}

impl Endpoint {
    /// The address as the caller wrote it.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// The socket address for literal endpoints, `None` for hostnames.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.socket_addr
    }

    /// Returns the socket address in a form a socket of the given family can send to.
    ///
    /// An IPv6 socket reaches IPv4 destinations through their v4-mapped form. A
    /// v4-mapped IPv6 literal is unwrapped for IPv4 sockets. Any other mismatch is
    /// returned unchanged so the OS reports it.
    pub fn socket_addr_for(&self, ipv6_socket: bool) -> Option<SocketAddr> {
        let addr = self.socket_addr?;
        let mapped = match (addr, ipv6_socket) {
            (SocketAddr::V4(v4), true) => SocketAddr::V6(SocketAddrV6::new(
                v4.ip().to_ipv6_mapped(),
                v4.port(),
                0,
                0,
            )),
            (SocketAddr::V6(v6), false) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
                None => addr,
            },
            _ => addr,
        };
        Some(mapped)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            AddressFamily::Ipv6 => write!(f, "[{}]:{}", self.address, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

/// Stateless literal-address resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddressResolver;

impl AddressResolver {
    pub fn new() -> Self {
        Self
    }

    /// Classifies `address` and pairs it with `port`.
    ///
    /// Fails with [`AddressErrorKind::Malformed`] when the input is empty, looks like
    /// an IPv6 literal (contains `:`) but does not parse as one, consists of digits
    /// and dots but is not a valid IPv4 literal, or is not a valid hostname.
    pub fn resolve(&self, address: &str, port: u16) -> Result<Endpoint, AddressError> {
        if address.is_empty() {
            return Err(AddressError::malformed(address, "empty address"));
        }

        if let Some(inner) = address
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            let addr = parse_ipv6(address, inner, port)?;
            return Ok(literal(inner, port, AddressFamily::Ipv6, addr));
        }

        if address.contains(':') {
            let addr = parse_ipv6(address, address, port)?;
            return Ok(literal(address, port, AddressFamily::Ipv6, addr));
        }

        if address.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
            let ip: Ipv4Addr = address
                .parse()
                .map_err(|_| AddressError::malformed(address, "invalid IPv4 literal"))?;
            let addr = SocketAddr::new(IpAddr::V4(ip), port);
            return Ok(literal(address, port, AddressFamily::Ipv4, addr));
        }

        validate_hostname(address)?;
        Ok(Endpoint {
            address: address.to_owned(),
            port,
            family: AddressFamily::Unresolved,
            socket_addr: None,
        })
    }
}

fn literal(address: &str, port: u16, family: AddressFamily, addr: SocketAddr) -> Endpoint {
    Endpoint {
        address: address.to_owned(),
        port,
        family,
        socket_addr: Some(addr),
    }
}

fn parse_ipv6(original: &str, literal: &str, port: u16) -> Result<SocketAddr, AddressError> {
    let (ip, scope) = match literal.split_once('%') {
        Some((ip, scope)) => {
            let scope_id = scope
                .parse::<u32>()
                .map_err(|_| AddressError::malformed(original, "invalid IPv6 scope id"))?;
            (ip, scope_id)
        }
        None => (literal, 0),
    };
    let ip: Ipv6Addr = ip
        .parse()
        .map_err(|_| AddressError::malformed(original, "invalid IPv6 literal"))?;
    Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope)))
}

fn validate_hostname(address: &str) -> Result<(), AddressError> {
    let name = address.strip_suffix('.').unwrap_or(address);
    if name.is_empty() || name.len() > MAX_HOSTNAME_LEN {
        return Err(AddressError::malformed(address, "invalid hostname length"));
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(AddressError::malformed(address, "invalid hostname label"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(AddressError::malformed(address, "hostname label edge hyphen"));
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(AddressError::malformed(address, "illegal hostname character"));
        }
    }
    Ok(())
}

/// Shorthand for [`AddressResolver::resolve`].
pub fn resolve(address: &str, port: u16) -> Result<Endpoint, AddressError> {
    AddressResolver.resolve(address, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_literal() {
        let ep = resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(ep.family(), AddressFamily::Ipv4);
        assert_eq!(ep.socket_addr(), Some("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(ep.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_ipv6_compressed_forms() {
        for addr in ["::1", "::", "2a00:1450:4007:804::1011", "::ffff:1.2.3.4", "[::1]"] {
            let ep = resolve(addr, 80).unwrap();
            assert_eq!(ep.family(), AddressFamily::Ipv6, "{addr}");
        }
        let ep = resolve("[::1]", 443).unwrap();
        assert_eq!(ep.address(), "::1");
        assert_eq!(ep.to_string(), "[::1]:443");
    }

    #[test]
    fn test_ipv6_scope_id() {
        let ep = resolve("fe80::1%3", 9).unwrap();
        match ep.socket_addr() {
            Some(SocketAddr::V6(v6)) => assert_eq!(v6.scope_id(), 3),
            other => panic!("unexpected {:?}", other),
        }
        assert!(resolve("fe80::1%eth0", 9).is_err());
    }

    #[test]
    fn test_malformed_ipv6() {
        for addr in ["1:A", "1:2:3:4:5:6:7:8:9", "::g", "1::2::3", "[::1", "[1:A]"] {
            let err = resolve(addr, 1234).unwrap_err();
            assert_eq!(err.kind(), AddressErrorKind::Malformed, "{addr}");
        }
    }

    #[test]
    fn test_malformed_ipv4_and_hostnames() {
        for addr in ["", "256.0.0.1", "1.2.3", "123", "bad_host", "-lead.example", "a..b", " ::1"]
        {
            assert!(resolve(addr, 1).is_err(), "{addr:?} should be malformed");
        }
        let long_label = "a".repeat(64);
        assert!(resolve(&long_label, 1).is_err());
    }

    #[test]
    fn test_hostname_is_unresolved() {
        let ep = resolve("ipv6.example.com.", 80).unwrap();
        assert_eq!(ep.family(), AddressFamily::Unresolved);
        assert_eq!(ep.socket_addr(), None);
        assert_eq!(ep.socket_addr_for(true), None);
    }

    #[test]
    fn test_dual_stack_mapping() {
        let v4 = resolve("241.2.3.4", 5555).unwrap();
        assert_eq!(
            v4.socket_addr_for(true),
            Some("[::ffff:241.2.3.4]:5555".parse().unwrap())
        );
        assert_eq!(v4.socket_addr_for(false), v4.socket_addr());

        let mapped = resolve("::ffff:127.0.0.1", 7).unwrap();
        assert_eq!(
            mapped.socket_addr_for(false),
            Some("127.0.0.1:7".parse().unwrap())
        );

        let v6 = resolve("::1", 7).unwrap();
        assert_eq!(v6.socket_addr_for(false), v6.socket_addr());
    }

    #[test]
    fn test_error_display() {
        let err = resolve("1:A", 1).unwrap_err();
        assert_eq!(err.address(), "1:A");
        assert!(err.to_string().contains("malformed"));
    }
}
