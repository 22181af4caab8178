#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::net::policy::ErrorHandlingPolicy;

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
/// Also the largest datagram that can be received intact.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_LISTEN_BACKLOG: i32 = 1024;

/// Configuration for a [`Reactor`](crate::reactor::Reactor).
///
/// Use `ReactorConfig::builder()` for ergonomic construction.
///
/// ## Resource Limits
///
/// - events_capacity: readiness events drained per poll
/// - read_buffer_size: size of the scratch buffer shared by all reads
/// - max_connections: cap on concurrently accepted peers (None for unlimited)
///
/// ## Socket Options
///
/// - no_delay: When enabled (default), disables Nagle's algorithm on TCP streams
/// - send_error_handling: policy new datagram sockets start with
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ReactorConfig {
    /// Maximum readiness events handled per poll
    pub events_capacity: usize,
    /// Size of the shared read buffer
    pub read_buffer_size: usize,
    /// Maximum number of accepted connections
    pub max_connections: Option<usize>,
    /// Enable TCP_NODELAY
    pub no_delay: bool,
    /// Backlog passed to listen(2)
    pub listen_backlog: i32,
    /// Default send error handling for datagram sockets
    pub send_error_handling: ErrorHandlingPolicy,
}

impl ReactorConfig {
    /// Create a new builder for ReactorConfig
    pub fn builder() -> ReactorConfigBuilder {
        ReactorConfigBuilder::new()
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_connections: None,
            no_delay: true,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            send_error_handling: ErrorHandlingPolicy::default(),
        }
    }
}

/// Builder for ReactorConfig.
///
/// Fields left unset take their values from ReactorConfig::default().
#[derive(Default)]
pub struct ReactorConfigBuilder {
    events_capacity: Option<usize>,
    read_buffer_size: Option<usize>,
    max_connections: Option<usize>,
    no_delay: Option<bool>,
    listen_backlog: Option<i32>,
    send_error_handling: Option<ErrorHandlingPolicy>,
}

impl ReactorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = Some(backlog);
        self
    }

    /// Set the policy new datagram sockets start with
    pub fn send_error_handling(mut self, policy: ErrorHandlingPolicy) -> Self {
        self.send_error_handling = Some(policy);
        self
    }

    pub fn build(self) -> ReactorConfig {
        let default = ReactorConfig::default();
        ReactorConfig {
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity).max(1),
            read_buffer_size: self.read_buffer_size.unwrap_or(default.read_buffer_size).max(1),
            max_connections: self.max_connections.or(default.max_connections),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            listen_backlog: self.listen_backlog.unwrap_or(default.listen_backlog),
            send_error_handling: self
                .send_error_handling
                .unwrap_or(default.send_error_handling),
        }
    }
}
