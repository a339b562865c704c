//! Frame struct with typed accessors.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use accessory_bridge::protocol::{Command, Frame};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(Command::Test, Bytes::from_static(&[0x00, 0x05]));
//! assert_eq!(frame.command(), Command::Test);
//! assert_eq!(frame.payload(), &[0x00, 0x05]);
//! ```

use bytes::Bytes;

use super::command::Command;
use crate::error::Result;
use super::wire_format::{Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command code.
    pub command: Command,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(command: Command, payload: Bytes) -> Self {
        Self { command, payload }
    }

    /// Create a frame with no payload.
    pub fn empty(command: Command) -> Self {
        Self {
            command,
            payload: Bytes::new(),
        }
    }

    /// Create a frame from raw bytes (copies data).
    pub fn from_parts(command: Command, payload: &[u8]) -> Self {
        Self {
            command,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[inline]
    pub fn command(&self) -> Command {
        self.command
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Header describing this frame.
    ///
    /// Fails with `PayloadTooLarge` for payloads longer than `u32::MAX`.
    pub fn header(&self) -> Result<Header> {
        Header::for_payload(self.command, self.payload.len())
    }

    /// Encode the frame (header followed by payload).
    pub fn encode(&self) -> Result<Vec<u8>> {
        build_frame(self.command, &self.payload)
    }
}

/// Build a complete frame as a single byte vector.
///
/// # Example
///
/// ```
/// use accessory_bridge::protocol::{build_frame, Command, HEADER_SIZE};
///
/// let bytes = build_frame(Command::Test, &[0x00, 0x0F])?;
/// assert_eq!(bytes.len(), HEADER_SIZE + 2);
/// # Ok::<(), accessory_bridge::AccessoryError>(())
/// ```
pub fn build_frame(command: Command, payload: &[u8]) -> Result<Vec<u8>> {
    let header = Header::for_payload(command, payload.len())?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    Ok(buf)
}
