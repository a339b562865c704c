//! Protocol module - command codes, wire format, framing.
//!
//! Every message on the bulk pipe, in both directions, is:
//! `[2 bytes command][4 bytes length, big-endian][length bytes payload]`.

mod command;
mod frame;
mod frame_codec;
mod wire_format;

pub use command::{codes, Command};
pub use frame::{build_frame, Frame};
pub use frame_codec::{FrameCodec, Frames};
pub use wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
