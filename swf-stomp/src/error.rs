//! Error types for the STOMP wire layer

use thiserror::Error;

/// Result type alias for wire-layer operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Keywords that identify a transport failure as a lost connection.
///
/// Matched case-insensitively against the rendered error text.
pub const CONNECTION_ERROR_KEYWORDS: [&str; 4] = ["ssl", "eof", "connection", "broken pipe"];

/// Errors that can occur in wire-layer operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BusError {
    /// Malformed destination or subscription parameters, rejected before any network action
    #[error("Validation error: {0}")]
    Validation(String),

    /// Socket or protocol-level failure while talking to the broker
    #[error("Transport error: {0}")]
    Transport(String),

    /// The broker sent something that is not valid STOMP
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The broker answered CONNECT with an ERROR frame
    #[error("Broker rejected connection: {0}")]
    Rejected(String),

    /// No live connection is held by the transport
    #[error("Not connected: connection is not established")]
    NotConnected,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors
    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl BusError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Returns `true` if this error indicates the broker connection was lost.
    ///
    /// Validation errors never count, regardless of their text.
    pub fn is_connection_loss(&self) -> bool {
        match *self {
            Self::Validation(_) => false,
            Self::NotConnected => true,
            Self::Io(ref e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::UnexpectedEof
                ) =>
            {
                true
            }
            _ => is_connection_error_text(&self.to_string()),
        }
    }
}

/// Returns `true` if `text` mentions any of [`CONNECTION_ERROR_KEYWORDS`].
pub fn is_connection_error_text(text: &str) -> bool {
    let lowered = text.to_lowercase();
    CONNECTION_ERROR_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}
