//! Property-based tests for the frame codec.
//!
//! Uses proptest to validate:
//! - Decoding is independent of how the byte stream is chunked
//! - Encoding then decoding a frame yields the same command and payload
//! - Zero-length frames are emitted without waiting for more bytes

use accessory_bridge::protocol::{build_frame, Command, Frame, FrameCodec, HEADER_SIZE};
use proptest::prelude::*;

fn command_strategy() -> impl Strategy<Value = Command> {
    prop_oneof![
        Just(Command::None),
        Just(Command::Test),
        Just(Command::CamFrame),
        Just(Command::CamStart),
        Just(Command::CamStop),
        Just(Command::AppConnected),
        Just(Command::Terminate),
        Just(Command::Exit),
        any::<u16>().prop_map(Command::from_code),
    ]
}

fn frames_strategy() -> impl Strategy<Value = Vec<Frame>> {
    prop::collection::vec(
        (command_strategy(), prop::collection::vec(any::<u8>(), 0..96))
            .prop_map(|(command, payload)| Frame::from_parts(command, &payload)),
        0..12,
    )
}

fn encode_all(frames: &[Frame]) -> Vec<u8> {
    frames.iter().flat_map(|frame| frame.encode().unwrap()).collect()
}

/// Feed `bytes` in chunks whose sizes cycle through `sizes`.
fn decode_chunked(bytes: &[u8], sizes: &[usize]) -> Vec<Frame> {
    let mut codec = FrameCodec::new();
    let mut frames = Vec::new();
    let mut offset = 0;

    for size in sizes.iter().cycle() {
        if offset >= bytes.len() {
            break;
        }
        let end = (offset + size).min(bytes.len());
        for frame in codec.feed(&bytes[offset..end]) {
            frames.push(frame.unwrap());
        }
        offset = end;
    }

    assert!(codec.is_empty());
    frames
}

proptest! {
    /// Property: arbitrary chunk boundaries decode to the same frames
    #[test]
    fn prop_chunk_boundary_independence(
        frames in frames_strategy(),
        sizes in prop::collection::vec(1usize..40, 1..16),
    ) {
        let bytes = encode_all(&frames);

        let mut whole = FrameCodec::new();
        let contiguous: Vec<Frame> = whole.feed(&bytes).map(|f| f.unwrap()).collect();

        prop_assert_eq!(&contiguous, &frames);
        prop_assert_eq!(decode_chunked(&bytes, &sizes), contiguous);
    }

    /// Property: one byte at a time is the same as one block
    #[test]
    fn prop_single_byte_feed(frames in frames_strategy()) {
        let bytes = encode_all(&frames);
        prop_assert_eq!(decode_chunked(&bytes, &[1]), frames);
    }

    /// Property: encode then decode preserves command and payload
    #[test]
    fn prop_round_trip(
        command in command_strategy(),
        payload in prop::collection::vec(any::<u8>(), 0..1024),
    ) {
        let bytes = build_frame(command, &payload).unwrap();
        prop_assert_eq!(bytes.len(), HEADER_SIZE + payload.len());

        let mut codec = FrameCodec::new();
        let decoded = codec.push(&bytes).unwrap();
        prop_assert_eq!(decoded.len(), 1);
        prop_assert_eq!(decoded[0].command, command);
        prop_assert_eq!(decoded[0].payload(), &payload[..]);
    }

    /// Property: a zero-length header is emitted as soon as it is complete
    #[test]
    fn prop_empty_frame_emitted_immediately(
        command in command_strategy(),
        trailing in prop::collection::vec(any::<u8>(), 0..HEADER_SIZE),
    ) {
        let mut bytes = build_frame(command, &[]).unwrap();
        bytes.extend_from_slice(&trailing);

        let mut codec = FrameCodec::new();
        let decoded = codec.push(&bytes).unwrap();

        prop_assert_eq!(decoded, vec![Frame::empty(command)]);
        // Only the partial next header is left, never a payload step.
        prop_assert!(!codec.is_mid_frame());
        prop_assert_eq!(codec.len(), trailing.len());
    }
}
