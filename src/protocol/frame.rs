//! Frame struct and the stateless frame codec.
//!
//! A [`Frame`] holds the raw header document bytes and the opaque payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use hachi_nio::protocol::{encode, try_parse};
//! use hachi_nio::Header;
//!
//! let header = Header::with_transaction("GREETINGS");
//! let bytes = encode(&header, b"Hello World!").unwrap();
//!
//! let (frame, consumed) = try_parse(&bytes).unwrap().unwrap();
//! assert_eq!(consumed, bytes.len());
//! assert_eq!(frame.parse_header().unwrap(), header);
//! assert_eq!(frame.payload(), b"Hello World!");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{
    read_i32_le, validate_lengths, WireVersion, ABSOLUTE_MAX_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE,
    PREFIX_SIZE,
};
use crate::error::{HachiError, Result};
use crate::header::Header;

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header document bytes (UTF-8 JSON, not yet parsed).
    pub header: Bytes,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header bytes and payload.
    pub fn new(header: Bytes, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Raw header document bytes.
    #[inline]
    pub fn header_bytes(&self) -> &[u8] {
        &self.header
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Parse the header document.
    pub fn parse_header(&self) -> Result<Header> {
        Header::from_slice(&self.header)
    }

    /// Size of this frame on the wire for the given layout.
    #[inline]
    pub fn encoded_len(&self, version: WireVersion) -> usize {
        version.prefix_size() + self.header.len() + self.payload.len()
    }
}

/// Encode a header and payload into a current-version frame.
pub fn encode(header: &Header, payload: &[u8]) -> Result<Bytes> {
    encode_with(WireVersion::Current, header, payload)
}

/// Encode a header and payload using the given layout.
pub fn encode_with(version: WireVersion, header: &Header, payload: &[u8]) -> Result<Bytes> {
    let header_bytes = header.to_vec()?;
    encode_raw(version, &header_bytes, payload)
}

/// Encode pre-serialized header bytes and a payload.
///
/// Fails with [`HachiError::Oversize`] if the frame does not fit in the signed
/// 32-bit length field.
pub fn encode_raw(version: WireVersion, header: &[u8], payload: &[u8]) -> Result<Bytes> {
    let total = frame_size(version, header.len(), payload.len())?;

    let mut prefix = [0u8; PREFIX_SIZE];
    let prefix = &mut prefix[..version.prefix_size()];
    version.encode_prefix_into(prefix, total, header.len() as u32);

    let mut buf = BytesMut::with_capacity(total as usize);
    buf.put_slice(prefix);
    buf.put_slice(header);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Total wire size of a frame with the given segment lengths.
fn frame_size(version: WireVersion, header_len: usize, payload_len: usize) -> Result<u32> {
    let total = version.prefix_size() as u64 + header_len as u64 + payload_len as u64;
    if total > ABSOLUTE_MAX_FRAME_SIZE as u64 {
        return Err(HachiError::Oversize {
            size: total,
            max: ABSOLUTE_MAX_FRAME_SIZE as u64,
        });
    }
    Ok(total as u32)
}

/// Try to parse one current-version frame at the start of `buf`.
///
/// Returns:
/// - `Ok(Some((frame, consumed)))` if a complete frame is buffered
/// - `Ok(None)` if more bytes are needed
/// - `Err(ProtocolViolation)` if the framing is broken
pub fn try_parse(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    try_parse_with(WireVersion::Current, buf, DEFAULT_MAX_FRAME_SIZE)
}

/// Try to parse one frame using the given layout and size limit.
///
/// Bytes after the first frame are left untouched for the caller.
pub fn try_parse_with(
    version: WireVersion,
    buf: &[u8],
    max_frame_size: u32,
) -> Result<Option<(Frame, usize)>> {
    if let Some(magic) = version.magic() {
        if buf.len() >= magic.len() {
            version.check_magic(buf)?;
        }
    }

    let prefix = version.prefix_size();
    let (Some(total), Some(header)) = (
        read_i32_le(buf, version.total_length_offset()),
        read_i32_le(buf, version.header_length_offset()),
    ) else {
        return Ok(None);
    };

    let (total, header) = validate_lengths(version, total, header, max_frame_size)?;
    if buf.len() < total {
        return Ok(None);
    }

    let frame = Frame::new(
        Bytes::copy_from_slice(&buf[prefix..prefix + header]),
        Bytes::copy_from_slice(&buf[prefix + header..total]),
    );
    Ok(Some((frame, total)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire_format::LEGACY_PREFIX_SIZE;

    #[test]
    fn test_greetings_frame_bytes() {
        let header = Header::with_transaction("GREETINGS");
        let bytes = encode(&header, b"Hello World!").unwrap();

        let header_json = br#"{"transaction":"GREETINGS"}"#;
        let mut expected = Vec::new();
        expected.extend_from_slice(b"HNIO");
        expected.extend_from_slice(&51i32.to_le_bytes());
        expected.extend_from_slice(&27i32.to_le_bytes());
        expected.extend_from_slice(header_json);
        expected.extend_from_slice(b"Hello World!");

        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn test_greetings_frame_parses_back() {
        let header = Header::with_transaction("GREETINGS");
        let bytes = encode(&header, b"Hello World!").unwrap();

        let (frame, consumed) = try_parse(&bytes).unwrap().unwrap();
        assert_eq!(consumed, 51);
        assert_eq!(frame.parse_header().unwrap(), header);
        assert_eq!(frame.payload(), b"Hello World!");
    }

    #[test]
    fn test_empty_header_and_payload() {
        let bytes = encode_raw(WireVersion::Current, b"", b"").unwrap();
        assert_eq!(bytes.len(), PREFIX_SIZE);

        let (frame, consumed) = try_parse(&bytes).unwrap().unwrap();
        assert_eq!(consumed, PREFIX_SIZE);
        assert!(frame.header_bytes().is_empty());
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn test_incomplete_prefix() {
        let bytes = encode(&Header::with_transaction("A"), b"data").unwrap();
        for len in 0..PREFIX_SIZE {
            assert!(try_parse(&bytes[..len]).unwrap().is_none(), "len {}", len);
        }
    }

    #[test]
    fn test_incomplete_body() {
        let bytes = encode(&Header::with_transaction("A"), b"data").unwrap();
        assert!(try_parse(&bytes[..bytes.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn test_trailing_bytes_untouched() {
        let first = encode(&Header::with_transaction("A"), b"one").unwrap();
        let second = encode(&Header::with_transaction("B"), b"two").unwrap();
        let mut buf = first.to_vec();
        buf.extend_from_slice(&second);

        let (frame, consumed) = try_parse(&buf).unwrap().unwrap();
        assert_eq!(consumed, first.len());
        assert_eq!(frame.payload(), b"one");

        let (frame, consumed) = try_parse(&buf[consumed..]).unwrap().unwrap();
        assert_eq!(consumed, second.len());
        assert_eq!(frame.payload(), b"two");
    }

    #[test]
    fn test_bad_magic_is_protocol_violation() {
        let mut bytes = encode(&Header::with_transaction("A"), b"x").unwrap().to_vec();
        bytes[0] = b'X';

        let err = try_parse(&bytes).unwrap_err();
        assert!(matches!(err, HachiError::ProtocolViolation(_)));
    }

    #[test]
    fn test_bad_magic_detected_before_full_prefix() {
        assert!(try_parse(b"GET /").is_err());
    }

    #[test]
    fn test_inconsistent_lengths_rejected() {
        let mut bytes = encode_raw(WireVersion::Current, b"{}", b"").unwrap().to_vec();
        // Header length larger than the frame can hold
        bytes[8..12].copy_from_slice(&100i32.to_le_bytes());

        assert!(matches!(
            try_parse(&bytes),
            Err(HachiError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_frame_above_limit_rejected() {
        let bytes = encode_raw(WireVersion::Current, b"{}", &[0u8; 64]).unwrap();
        let result = try_parse_with(WireVersion::Current, &bytes, 32);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_legacy_round_trip() {
        let header = Header::with_transaction("OLD");
        let bytes = encode_with(WireVersion::Legacy, &header, b"payload").unwrap();

        assert_ne!(&bytes[..4], b"HNIO");
        assert_eq!(read_i32_le(&bytes, 0), Some(bytes.len() as i32));

        let (frame, consumed) = try_parse_with(WireVersion::Legacy, &bytes, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(frame.parse_header().unwrap(), header);
        assert_eq!(frame.payload(), b"payload");
        assert_eq!(frame.encoded_len(WireVersion::Legacy), consumed);
        assert_eq!(
            frame.encoded_len(WireVersion::Current),
            consumed - LEGACY_PREFIX_SIZE + PREFIX_SIZE
        );
    }

    #[test]
    fn test_oversize_rejected() {
        let err = frame_size(WireVersion::Current, 16, i32::MAX as usize).unwrap_err();
        assert!(matches!(err, HachiError::Oversize { .. }));

        let err = frame_size(WireVersion::Current, i32::MAX as usize, 0).unwrap_err();
        assert!(matches!(err, HachiError::Oversize { .. }));

        // Exactly at the limit is still encodable
        let max = ABSOLUTE_MAX_FRAME_SIZE as usize;
        assert_eq!(
            frame_size(WireVersion::Current, 0, max - PREFIX_SIZE).unwrap(),
            ABSOLUTE_MAX_FRAME_SIZE
        );
    }

    #[test]
    fn test_binary_payload_preserved() {
        let payload: Vec<u8> = (0..=255).collect();
        let bytes = encode(&Header::new(), &payload).unwrap();
        let (frame, _) = try_parse(&bytes).unwrap().unwrap();
        assert_eq!(frame.payload(), &payload[..]);
    }
}
