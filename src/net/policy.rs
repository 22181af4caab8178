//! Send-error handling for datagram sockets.
//!
//! A datagram socket learns about failed deliveries after the fact: the OS reports
//! them when the queued datagram is flushed, or later through the socket's pending
//! error. Each such event is classified by the socket's [`ErrorHandlingPolicy`]:
//!
//! ```text
//!   AsyncSocketError ──> Ignore ──> Discard            (socket untouched)
//!                    ──> Drop   ──> TearDown(reason)   (unbind fires once)
//!                    ──> Report ──> Report(error)      (receive_senderror,
//!                                                       error flag set until
//!                                                       the next cycle)
//! ```
//!
//! Stream sockets never consult the policy: every TCP I/O error is fatal.

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::errors::{AsyncSocketError, UnbindReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ErrorHandlingPolicy {
    /// Discard async errors silently.
    Ignore,
    /// Tear the socket down on the first async error.
    #[default]
    #[cfg_attr(feature = "serde", serde(alias = "kill"))]
    Drop,
    /// Hand async errors to the handler and keep the socket open.
    Report,
}

/// What the reactor does with one async error event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAction {
    Discard,
    TearDown(UnbindReason),
    Report(AsyncSocketError),
}

impl ErrorHandlingPolicy {
    pub fn classify(self, error: AsyncSocketError) -> ErrorAction {
        match self {
            ErrorHandlingPolicy::Ignore => ErrorAction::Discard,
            ErrorHandlingPolicy::Drop => ErrorAction::TearDown(UnbindReason::SendFailed(error)),
            ErrorHandlingPolicy::Report => ErrorAction::Report(error),
        }
    }

    /// Whether an error under this policy raises the transient `is_error` flag.
    pub fn flags_errors(self) -> bool {
        matches!(self, ErrorHandlingPolicy::Report)
    }
}

impl fmt::Display for ErrorHandlingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorHandlingPolicy::Ignore => f.write_str("ignore"),
            ErrorHandlingPolicy::Drop => f.write_str("drop"),
            ErrorHandlingPolicy::Report => f.write_str("report"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown send error handling policy {0:?}")]
pub struct ParsePolicyError(String);

impl FromStr for ErrorHandlingPolicy {
    type Err = ParsePolicyError;

    /// Accepts `ignore`, `drop` (or `kill`) and `report`, case-insensitively and
    /// with an optional `errorhandling_` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let name = lowered
            .strip_prefix("errorhandling_")
            .unwrap_or(&lowered);
        match name {
            "ignore" => Ok(ErrorHandlingPolicy::Ignore),
            "drop" | "kill" => Ok(ErrorHandlingPolicy::Drop),
            "report" => Ok(ErrorHandlingPolicy::Report),
            _ => Err(ParsePolicyError(s.to_owned())),
        }
    }
}
