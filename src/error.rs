use std::io;

use thiserror::Error;

/// Result type used across this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, OS, etc.).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// No reply arrived within the retry budget.
    #[error("timeout waiting for response")]
    Timeout,

    /// Peer sent an unexpected or invalid frame.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// A command completed with a non-zero completion code.
    #[error("completion code: {completion_code:#04x}")]
    CompletionCode {
        /// Raw completion code returned by the controller.
        completion_code: u8,
    },

    /// A repository fetch was invalidated too many times in a row.
    #[error("repository fetch retries exhausted")]
    FetchRetriesExceeded,

    /// Unsupported configuration or protocol feature.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Invalid caller-supplied argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The connection has been shut down.
    #[error("connection is closed")]
    Closed,
}

impl Error {
    /// True for the completion codes that signal a lost repository
    /// reservation (data changed mid-read or reservation cancelled).
    pub(crate) fn is_reservation_lost(&self) -> bool {
        matches!(
            self,
            Error::CompletionCode {
                completion_code: crate::types::cc::DATA_CHANGED
            } | Error::CompletionCode {
                completion_code: crate::types::cc::INVALID_RESERVATION
            }
        )
    }
}
