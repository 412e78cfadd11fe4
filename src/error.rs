//! # Error Types
//!
//! Custom error types for Logger Link using `thiserror`.

use thiserror::Error;

/// Main error type for Logger Link
#[derive(Debug, Error)]
pub enum LoggerLinkError {
    /// No connection to the data logger is currently published
    #[error("No connection to data logger")]
    NoConnection,

    /// Timeout, peer close or short write on the stream
    #[error("Channel fault: {0}")]
    ChannelFault(String),

    /// The channel is held by another operation (e.g. a running download)
    #[error("Channel busy")]
    ChannelBusy,

    /// Well-formed bytes whose content violates the line/field grammar
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    /// Command that cannot be put on the wire
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Bounded reconnect policy gave up
    #[error("Gave up connecting to {peer} after {attempts} attempts")]
    ReconnectExhausted { peer: String, attempts: u32 },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoggerLinkError {
    /// Link-level failures that are recovered by reconnecting, never fatal
    pub fn is_link_fault(&self) -> bool {
        matches!(self, Self::NoConnection | Self::ChannelFault(_))
    }

    /// Failures after which the current connection can no longer be trusted
    ///
    /// A decode error means the stream is desynchronized, so the connection
    /// is dropped along with genuine channel faults.
    pub fn tears_down_link(&self) -> bool {
        matches!(self, Self::ChannelFault(_) | Self::ProtocolDecode(_))
    }
}

/// Result type alias for Logger Link
pub type Result<T> = std::result::Result<T, LoggerLinkError>;
