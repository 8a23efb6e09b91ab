//! Error types for the simulation harness and CLI.

use robotworld_core::CoreError;
use robotworld_env::EnvError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// Configuration file could not be used
    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Environment error: {0}")]
    Env(#[from] EnvError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Peer mode could not complete a request
    #[error("Peer error: {0}")]
    Peer(String),
}
