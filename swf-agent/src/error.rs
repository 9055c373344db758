//! Error types for the agent core

use swf_common::{ConfigError, MonitorError};
use swf_stomp::BusError;
use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors surfaced by the agent core
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AgentError {
    /// Caller supplied an unusable destination, prefetch or similar
    #[error("{0}")]
    Validation(String),

    /// Broker transport failure
    #[error("Transport error: {0}")]
    Transport(BusError),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// A message handler failed
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Startup connection retries exhausted
    #[error("Failed to connect to broker after {attempts} attempts: {last_error}")]
    ConnectFailed { attempts: u32, last_error: BusError },

    /// Monitor API failure where it is fatal
    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// Outbound body could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<BusError> for AgentError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Validation(msg) => Self::Validation(msg),
            other => Self::Transport(other),
        }
    }
}

/// Failure reported by a message handler; the delivery is rejected.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HandlerError {
    /// The body could not be understood
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Processing failed
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
