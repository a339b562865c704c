//! Error types for accessory-bridge.

use thiserror::Error;

/// Main error type for all accessory operations.
#[derive(Debug, Error)]
pub enum AccessoryError {
    /// I/O error (config files, OS signal registration).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading a configuration file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A bulk transfer did not complete before its timeout.
    ///
    /// Recoverable: reads are resubmitted, the current write is skipped.
    #[error("Transfer timed out")]
    TransportTimeout,

    /// Any other transport failure. Fatal to the session.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed payload for a known command.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame header declared a payload above the configured maximum.
    ///
    /// The stream cannot be re-synchronised after this.
    #[error("Frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: u32, max: u32 },

    /// An outbound payload does not fit the 32-bit length field.
    #[error("Payload of {length} bytes does not fit a frame")]
    PayloadTooLarge { length: usize },

    /// No accessory device could be acquired.
    #[error("Device not found after {attempts} attempts")]
    DeviceNotFound { attempts: u32 },

    /// Writer queue is full (only returned by the non-blocking enqueue).
    #[error("Writer queue full")]
    QueueFull,

    /// Connection closed or session not connected.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failure reported by the capture source.
    #[error("Capture error: {0}")]
    Capture(String),
}

impl AccessoryError {
    /// True for transfer timeouts.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, AccessoryError::TransportTimeout)
    }

    /// True for errors that must close the active session.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            AccessoryError::Transport(_)
                | AccessoryError::FrameTooLarge { .. }
                | AccessoryError::ConnectionClosed
                | AccessoryError::Io(_)
        )
    }
}

/// Result type alias using AccessoryError.
pub type Result<T> = std::result::Result<T, AccessoryError>;
