//! Error taxonomy for the profiling session.
//!
//! Every failure surfaced to the user maps to one of the process exit codes:
//! 0 success, 1 hardware/topology problem, 2 I/O, protocol, or tool failure,
//! 3 user error. The mapping lives here so the callers never hand-pick codes.

use thiserror::Error;

/// Transport-level failures on a [`crate::comm::Connection`] or
/// [`crate::comm::Acceptor`].
#[derive(Error, Debug)]
pub enum CommError {
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("read timed out")]
    Timeout,

    #[error("address already in use")]
    AlreadyInUse,

    #[error("peer sent an invalid connection handshake")]
    Handshake,

    /// The peer closed the connection. Clean for a data stream that has
    /// delivered `<STOP>`, fatal anywhere else.
    #[error("connection closed by peer")]
    Closed,
}

/// Session-level failures. Each variant carries its exit code via
/// [`SessionError::exit_code`].
#[derive(Error, Debug)]
pub enum SessionError {
    /// Invalid flag combination, missing command, malformed config.
    #[error("{0}")]
    User(String),

    /// Tool paths missing or of the wrong type, unsupported CPU vendor.
    #[error("{0}")]
    Env(String),

    /// CPU topology cannot satisfy the requested isolation.
    #[error("{0}")]
    Topology(String),

    #[error(transparent)]
    Comm(#[from] CommError),

    /// Unexpected frame or out-of-state message on the control channel.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A spawned child other than the profiled command failed.
    #[error("{tool} exited with code {code}")]
    Tool { tool: String, code: i32 },
}

impl SessionError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::User(_) => 3,
            SessionError::Topology(_) => 1,
            SessionError::Env(_)
            | SessionError::Comm(_)
            | SessionError::Protocol(_)
            | SessionError::Tool { .. } => 2,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Comm(CommError::Connection(err))
    }
}
