use std::io;

use thiserror::Error;

/// All the ways a client operation can fail.
///
/// Single-command semantic failures (job not found, not touched, etc.) are
/// not errors: they come back as `false` or `None` from the operation itself.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// The server replied `OUT_OF_MEMORY`.
    #[error("server is out of memory")]
    OutOfMemory,
    /// The server replied `INTERNAL_ERROR`.
    #[error("server reported an internal error")]
    InternalError,
    /// The server replied `DRAINING` and is not accepting new jobs.
    #[error("server is draining")]
    Draining,
    /// The request was malformed, either as judged by the server
    /// (`BAD_FORMAT`) or by the client before sending, e.g. an invalid tube
    /// name.
    #[error("bad format")]
    BadFormat,
    /// The server replied `UNKNOWN_COMMAND`.
    #[error("unknown command")]
    UnknownCommand,
    /// The job body exceeds the maximum job size.
    #[error("job too big")]
    JobTooBig,
    /// Connecting failed, the handshake probe was rejected, or the socket
    /// errored or closed. A `ReconnectingClient` retries these once.
    #[error("connection error: {0}")]
    Connection(String),
    /// The server sent something that doesn't fit the grammar expected for
    /// the command issued. Always fatal to the connection.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl Error {
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    pub(crate) fn closed() -> Self {
        Self::Connection("connection closed".to_owned())
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Connection(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
