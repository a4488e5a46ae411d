//! Programmer-error taxonomy (spec.md §7): raised synchronously, never
//! transitions session state.

use thiserror::Error;

/// Errors returned directly from a [`crate::session::Session`] method call,
/// as opposed to a [`crate::causes::Cause`] delivered asynchronously on
/// `ended`/`failed`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation is not valid in the session's current
    /// [`crate::session::Status`].
    #[error("invalid operation for current session state: {0}")]
    InvalidState(&'static str),

    /// The operation is not valid for the session's [`crate::session::Direction`].
    #[error("operation not supported for this session direction: {0}")]
    NotSupported(&'static str),

    /// A supplied argument failed validation (malformed target URI, DTMF
    /// tone outside `[0-9A-D#*,]`, out-of-range status code, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The signaling collaborator reported a failure building or sending a
    /// message.
    #[error("signaling error: {0}")]
    Signaling(#[from] crate::signaling::SignalingError),

    /// The dialog factory failed to construct a dialog.
    #[error("dialog error: {0}")]
    Dialog(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
