//! Wire format encoding and decoding.
//!
//! Implements the 6-byte header format:
//! ```text
//! ┌──────────┬──────────┐
//! │ Command  │ Length   │
//! │ 2 bytes  │ 4 bytes  │
//! │ uint16 BE│ uint32 BE│
//! └──────────┴──────────┘
//! ```
//!
//! Exactly `Length` payload bytes follow the header.

use super::command::Command;
use crate::error::{AccessoryError, Result};

/// Header size in bytes (fixed, exactly 6).
pub const HEADER_SIZE: usize = 6;

/// Default maximum payload size accepted by the decoder (32 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Command carried by the frame.
    pub command: Command,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(command: Command, payload_length: u32) -> Self {
        Self {
            command,
            payload_length,
        }
    }

    /// Header for a payload of `len` bytes.
    ///
    /// Fails with `PayloadTooLarge` if `len` does not fit in a `u32`.
    pub fn for_payload(command: Command, len: usize) -> Result<Self> {
        let payload_length =
            u32::try_from(len).map_err(|_| AccessoryError::PayloadTooLarge { length: len })?;
        Ok(Self::new(command, payload_length))
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use accessory_bridge::protocol::{Command, Header};
    ///
    /// let bytes = Header::new(Command::Test, 2).encode();
    /// assert_eq!(bytes, [0x00, 0x01, 0x00, 0x00, 0x00, 0x02]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.command.to_bytes());
        buf[2..6].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        match buf {
            [c0, c1, l0, l1, l2, l3, ..] => Some(Self {
                command: Command::from_bytes([*c0, *c1]),
                payload_length: u32::from_be_bytes([*l0, *l1, *l2, *l3]),
            }),
            _ => None,
        }
    }

    /// Reject payload lengths above `max_payload_size`.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(AccessoryError::FrameTooLarge {
                length: self.payload_length,
                max: max_payload_size,
            });
        }
        Ok(())
    }

    /// True if the frame carries no payload.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload_length == 0
    }
}
