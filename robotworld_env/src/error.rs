//! Error types for the RobotWorld environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Network send failed (channel closed, connection reset, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Target node is unknown or unreachable (no connection, simulated partition)
    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    /// Frame exceeds the maximum body size
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Frame body could not be parsed
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(node: impl std::fmt::Display) -> Self {
        Self::NodeUnreachable(node.to_string())
    }

    /// Creates a malformed frame error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }
}
