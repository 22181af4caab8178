use std::io;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::net::errors::ConnectionError;

/// Errors that end or prevent a run of the event loop.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to initialize the poller: {0}")]
    Init(#[source] io::Error),
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

pub type Result<T> = StdResult<T, Error>;
