//! Values exchanged between callers and the connection worker.

use std::fmt;
use std::time::Duration;

use crate::command::Command;
use crate::error::EngineError;

/// Result of one [`Engine::control`](crate::Engine::control) exchange.
///
/// On success `bytes` is exactly the span that matched the command's success
/// pattern. On timeout or failure match it is the whole incoming buffer at
/// the moment the outcome was decided. For formatting errors it is the
/// malformed expansion.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub bytes: Vec<u8>,
    pub error: Option<EngineError>,
    /// How long the exchange took, from write to decision.
    pub duration: Duration,
}

impl Response {
    /// A response carrying only an error.
    pub fn failed(error: EngineError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The payload, or the error if there was one.
    pub fn into_result(self) -> Result<Vec<u8>, EngineError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.bytes),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Response> Rx Bytes: \"{}\"\tErrors: ", self.bytes.escape_ascii())?;
        match &self.error {
            Some(err) => write!(f, "{err}")?,
            None => f.write_str("none")?,
        }
        write!(f, "\tDuration: {:?}", self.duration)
    }
}

/// A command with its expanded wire bytes, handed to the worker once.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) command: Command,
    pub(crate) bytes: Vec<u8>,
}
