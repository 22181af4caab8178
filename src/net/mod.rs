//! Networking pieces the reactor is built from.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Application                       │
//! │   connect / start_server / open_datagram_socket             │
//! │   send_data / send_datagram / close_connection              │
//! └────────────┬──────────────────────▲─────────────────────────┘
//!              │ address              │ hooks: connection_completed,
//!              ▼                      │ receive_data, receive_senderror,
//! ┌──────────────────────┐            │ unbind
//! │ address::resolve     │            │
//! │ (IPv4 / IPv6 / host) │            │
//! └──────────┬───────────┘            │
//!            ▼                        │
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Reactor: connection::ConnectionState per socket             │
//! │   socket::SocketHandle ── async errors ──▶ policy::classify │
//! └────────────┬────────────────────────────────────────────────┘
//!              │ OS events
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Operating System (epoll/kqueue/IOCP)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod address;
pub mod connection;
#[cfg(target_os = "linux")]
mod errqueue;
pub mod errors;
pub mod policy;
pub mod socket;
