//! Error types for the arbiter engine.
//!
//! `EngineError` is what a caller sees inside a [`Response`](crate::Response):
//! the categorical outcomes of formatting, waiting and transport. It is
//! `Clone` because the worker re-delivers a stored transport error on every
//! request it rejects afterwards.

use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by [`Command::bytes`](crate::Command::bytes) and
/// [`Engine`](crate::Engine) operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The template received the wrong count, type or order of arguments.
    ///
    /// `formed` holds the text the formatter produced, including its `%!`
    /// markers.
    #[error("proper arguments not provided to expand command into bytes: {formed:?}")]
    Args { formed: String },

    /// The formatted text does not satisfy the command's validation pattern.
    #[error("formed command {formed:?} does not match allowable format for outgoing commands")]
    Format { formed: String },

    /// Neither the success nor the failure pattern matched before the deadline.
    #[error("did not get the required response in the duration specified")]
    Timeout,

    /// Another request is already in flight on this connection.
    #[error("busy: another operation in progress")]
    Busy,

    /// The engine was never dialed, or has been closed.
    #[error("not connected")]
    NotConnected,

    /// The command's failure pattern matched the incoming bytes.
    #[error("device returned error response")]
    Match,

    /// Error from the underlying stream, passed through as-is.
    #[error("transport error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl EngineError {
    /// Whether this is an ordinary outcome of normal operation rather than a
    /// broken connection or a caller bug.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::Timeout | EngineError::Busy | EngineError::Match)
    }

    /// The malformed expansion carried by `Args` and `Format` errors.
    pub fn formed(&self) -> Option<&str> {
        match self {
            EngineError::Args { formed } | EngineError::Format { formed } => Some(formed),
            _ => None,
        }
    }

    /// The transport error, if this is one.
    pub fn io(&self) -> Option<&std::io::Error> {
        match self {
            EngineError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(Arc::new(err))
    }
}

/// A transport kind that has no implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unable to create an engine of type {0:?}")]
pub struct UnknownTransport(pub String);

/// Errors raised while compiling commands or building a command catalogue.
#[derive(Debug, Error)]
pub enum CommandError {
    /// One of the command's patterns is not a valid regular expression.
    #[error("command {command:?}: invalid {field} pattern")]
    InvalidPattern {
        command: String,
        field: &'static str,
        #[source]
        source: regex::Error,
    },

    /// Two commands in one catalogue share a name.
    #[error("duplicate command name {0:?}")]
    DuplicateName(String),

    /// The catalogue JSON could not be parsed.
    #[error("invalid command catalogue: {0}")]
    Json(#[from] serde_json::Error),
}
