//! Error types for the world store and protocol layer.

use robotworld_env::EnvError;
use thiserror::Error;

/// Errors raised while decoding protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("Empty message")]
    Empty,

    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("Unknown message type name: {0}")]
    UnknownName(String),

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Errors from the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A reconstruction script line could not be parsed
    #[error("Script error on line {line}: {reason}")]
    Script { line: usize, reason: String },

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Environment error: {0}")]
    Env(#[from] EnvError),
}

impl CoreError {
    /// Creates a script error.
    pub fn script(line: usize, reason: impl Into<String>) -> Self {
        Self::Script {
            line,
            reason: reason.into(),
        }
    }
}
