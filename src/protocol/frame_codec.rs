//! Incremental frame decoder.
//!
//! Bytes arrive from bulk reads at arbitrary chunk boundaries. The codec keeps
//! them in a single `BytesMut` and runs a two-state machine:
//! - `Header`: need [`HEADER_SIZE`] bytes
//! - `Payload`: header decoded, need `remaining` payload bytes
//!
//! A header declaring length zero yields a frame immediately and the codec
//! stays in `Header` mode.
//!
//! # Example
//!
//! ```
//! use accessory_bridge::protocol::{build_frame, Command, FrameCodec};
//!
//! let mut codec = FrameCodec::new();
//! let bytes = build_frame(Command::Test, &[0x00, 0x05]).unwrap();
//!
//! assert_eq!(codec.feed(&bytes[..4]).count(), 0);
//! let frames: Vec<_> = codec.feed(&bytes[4..]).collect::<Result<_, _>>().unwrap();
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].command, Command::Test);
//! ```

use bytes::BytesMut;

use super::command::Command;
use super::frame::Frame;
use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use crate::error::Result;

/// Initial accumulation buffer capacity (matches one bulk read).
const INITIAL_CAPACITY: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Payload { command: Command, remaining: usize },
}

/// Parser state for one read pipeline.
///
/// Created once per session and owned by the read pipeline only.
#[derive(Debug)]
pub struct FrameCodec {
    buffer: BytesMut,
    state: State,
    max_payload_size: u32,
}

impl FrameCodec {
    /// Create a codec with the default payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a codec with a custom payload limit.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            state: State::Header,
            max_payload_size,
        }
    }

    /// Append newly arrived bytes and return the frames they complete.
    ///
    /// The iterator is lazy: frames not pulled from it stay buffered and are
    /// yielded by the next call to [`feed`](Self::feed) or
    /// [`frames`](Self::frames). Partial data is never discarded.
    pub fn feed(&mut self, data: &[u8]) -> Frames<'_> {
        self.extend(data);
        self.frames()
    }

    /// Append bytes without extracting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Iterate over the frames currently complete in the buffer.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            codec: self,
            failed: false,
        }
    }

    /// Feed bytes and collect every complete frame.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.feed(data).collect()
    }

    /// Extract a single frame if one is complete.
    ///
    /// Never consumes more bytes than that one frame requires.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::Header => {
                    let header = match Header::decode(&self.buffer) {
                        Some(h) => h,
                        None => return Ok(None),
                    };
                    header.validate(self.max_payload_size)?;
                    let _ = self.buffer.split_to(HEADER_SIZE);

                    if header.is_empty() {
                        return Ok(Some(Frame::empty(header.command)));
                    }

                    self.state = State::Payload {
                        command: header.command,
                        remaining: header.payload_length as usize,
                    };
                }
                State::Payload { command, remaining } => {
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = State::Header;
                    return Ok(Some(Frame::new(command, payload)));
                }
            }
        }
    }

    /// Bytes required before the current state can advance.
    pub fn bytes_needed(&self) -> usize {
        match self.state {
            State::Header => HEADER_SIZE,
            State::Payload { remaining, .. } => remaining,
        }
    }

    /// True while waiting for a payload.
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, State::Payload { .. })
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop buffered bytes and return to header mode.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::Header;
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy iterator over complete frames. See [`FrameCodec::feed`].
///
/// Stops after the first error; the codec should be discarded at that point.
pub struct Frames<'a> {
    codec: &'a mut FrameCodec,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.codec.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AccessoryError;
    use crate::protocol::build_frame;

    #[test]
    fn test_single_complete_frame() {
        let mut codec = FrameCodec::new();
        let frames = codec.push(&build_frame(Command::Test, &[0, 5]).unwrap()).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, Command::Test);
        assert_eq!(frames[0].payload(), &[0, 5]);
        assert!(codec.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut codec = FrameCodec::new();
        let mut combined = build_frame(Command::AppConnected, &[]).unwrap();
        combined.extend(build_frame(Command::Test, &[0, 1]).unwrap());
        combined.extend(build_frame(Command::CamStart, &[]).unwrap());

        let frames = codec.push(&combined).unwrap();
        let commands: Vec<_> = frames.iter().map(|f| f.command).collect();
        assert_eq!(
            commands,
            vec![Command::AppConnected, Command::Test, Command::CamStart]
        );
    }

    #[test]
    fn test_fragmented_header() {
        let mut codec = FrameCodec::new();
        let bytes = build_frame(Command::Test, &[0, 9]).unwrap();

        assert!(codec.push(&bytes[..3]).unwrap().is_empty());
        assert!(!codec.is_mid_frame());
        assert_eq!(codec.bytes_needed(), HEADER_SIZE);

        let frames = codec.push(&bytes[3..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(codec.is_empty());
    }

    #[test]
    fn test_fragmented_payload() {
        let mut codec = FrameCodec::new();
        let payload = vec![0x5A; 100];
        let bytes = build_frame(Command::CamFrame, &payload).unwrap();

        assert!(codec.push(&bytes[..HEADER_SIZE + 10]).unwrap().is_empty());
        assert!(codec.is_mid_frame());
        assert_eq!(codec.bytes_needed(), 100);

        let frames = codec.push(&bytes[HEADER_SIZE + 10..]).unwrap();
        assert_eq!(frames[0].payload(), payload.as_slice());
        assert!(!codec.is_mid_frame());
    }

    #[test]
    fn test_zero_length_dispatches_before_next_header() {
        let mut codec = FrameCodec::new();
        let mut bytes = build_frame(Command::Exit, &[]).unwrap();
        // Only half of the next header follows.
        bytes.extend_from_slice(&[0x00, 0x01, 0x00]);

        let frames = codec.push(&bytes).unwrap();
        assert_eq!(frames, vec![Frame::empty(Command::Exit)]);
        assert!(!codec.is_mid_frame());
        assert_eq!(codec.len(), 3);
    }

    #[test]
    fn test_lazy_iterator_keeps_unpulled_frames() {
        let mut codec = FrameCodec::new();
        let mut bytes = build_frame(Command::CamStart, &[]).unwrap();
        bytes.extend(build_frame(Command::CamStop, &[]).unwrap());

        let first = codec.feed(&bytes).next().unwrap().unwrap();
        assert_eq!(first.command, Command::CamStart);

        let rest: Vec<_> = codec.frames().map(|f| f.unwrap().command).collect();
        assert_eq!(rest, vec![Command::CamStop]);
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut codec = FrameCodec::with_max_payload(64);
        let header = Header::new(Command::CamFrame, 65).encode();

        let mut frames = codec.feed(&header);
        assert!(matches!(
            frames.next(),
            Some(Err(AccessoryError::FrameTooLarge { length: 65, max: 64 }))
        ));
        assert!(frames.next().is_none());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut codec = FrameCodec::new();
        let mut bytes = build_frame(Command::Test, &[0, 42]).unwrap();
        bytes.extend(build_frame(Command::Terminate, &[]).unwrap());

        let mut all = Vec::new();
        for byte in &bytes {
            all.extend(codec.push(&[*byte]).unwrap());
        }
        assert_eq!(
            all,
            vec![
                Frame::from_parts(Command::Test, &[0, 42]),
                Frame::empty(Command::Terminate)
            ]
        );
    }

    #[test]
    fn test_clear_resets_state() {
        let mut codec = FrameCodec::new();
        let bytes = build_frame(Command::CamFrame, &[1, 2, 3, 4]).unwrap();
        codec.push(&bytes[..HEADER_SIZE + 1]).unwrap();
        assert!(codec.is_mid_frame());

        codec.clear();
        assert!(!codec.is_mid_frame());
        assert!(codec.is_empty());
    }
}
