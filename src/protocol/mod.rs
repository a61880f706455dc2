//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary framing layer:
//! - 12-byte prefix encoding/decoding (magic + little-endian lengths)
//! - Stateless frame codec (`encode`, `try_parse`)
//! - Frame buffer for accumulating partial reads

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{encode, encode_raw, encode_with, try_parse, try_parse_with, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    read_i32_le, validate_lengths, WireVersion, ABSOLUTE_MAX_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE,
    LEGACY_PREFIX_SIZE, MAGIC, PREFIX_SIZE, PROTOCOL_PROBLEM_LINE,
};
