//! Unified error types for Consilium

use std::time::Duration;
use thiserror::Error;

/// Unified error type for all Consilium operations
#[derive(Error, Debug)]
pub enum ConsiliumError {
    // Backend errors
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("CLI command path is not configured for {0}")]
    CommandNotConfigured(String),

    #[error("Failed to spawn agent process: {0}")]
    Spawn(String),

    #[error("Agent process timed out after {0:?}")]
    Timeout(Duration),

    // Participant errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    // Persistence errors
    #[error("Session store error: {0}")]
    Session(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using ConsiliumError
pub type Result<T> = std::result::Result<T, ConsiliumError>;
