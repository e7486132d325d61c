//! Error types for remote command execution

use std::fmt;
use thiserror::Error;

/// Signals that unwind out of the I/O driver unconditionally.
///
/// These are deliberately a separate type from [`RemoteError`]: a
/// per-connection failure is handled where it happens, while an abort must
/// propagate through every caller until the operation (or the process)
/// stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Abort {
    /// A cancellation request arrived and the caller opted into raising
    #[error("canceling wait for remote command results due to user request")]
    Interrupted,

    /// The supervising process exited; nothing useful can continue
    #[error("supervisor process exited, terminating")]
    SupervisorExit,
}

/// Command-level failure built from a non-OK result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFailure {
    /// Five-character SQL state code
    pub sqlstate: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub context: Option<String>,
    /// Worker the command ran on
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ResultFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.sqlstate, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        if let Some(context) = &self.context {
            write!(f, "\nCONTEXT: {}", context)?;
        }
        write!(
            f,
            "\nCONTEXT: while executing command on {}:{}",
            self.host, self.port
        )
    }
}

impl std::error::Error for ResultFailure {}

/// Errors surfaced by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Socket-level failure with no associated result
    #[error(
        "connection to the remote node {user}@{host}:{port} failed with the following error: {message}"
    )]
    Connection {
        user: String,
        host: String,
        port: u16,
        message: String,
    },

    /// A command completed with a non-OK result
    #[error(transparent)]
    Result(ResultFailure),

    /// Cancellation or supervisor exit; always propagated
    #[error(transparent)]
    Aborted(#[from] Abort),
}

pub type Result<T> = std::result::Result<T, RemoteError>;
