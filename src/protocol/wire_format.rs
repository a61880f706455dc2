//! Wire format constants and length-prefix layout.
//!
//! Implements the 12-byte frame prefix:
//! ```text
//! ┌──────────┬──────────────┬───────────────┬──────────┬──────────┐
//! │ Magic    │ Total length │ Header length │ Header   │ Payload  │
//! │ "HNIO"   │ int32 LE     │ int32 LE      │ JSON     │ opaque   │
//! │ 4 bytes  │ 4 bytes      │ 4 bytes       │ N bytes  │ M bytes  │
//! └──────────┴──────────────┴───────────────┴──────────┴──────────┘
//! ```
//!
//! `total_length` counts the whole frame, prefix included. All multi-byte
//! integers are Little Endian.
//!
//! The legacy layout drops the magic and shrinks the prefix to 8 bytes. The two
//! layouts do not interoperate; a listener speaks exactly one of them.

use crate::error::{HachiError, Result};

/// Protocol marker at the start of every current-version frame.
pub const MAGIC: [u8; 4] = *b"HNIO";

/// Prefix size of a current-version frame (magic + two lengths).
pub const PREFIX_SIZE: usize = 12;

/// Prefix size of a legacy frame (two lengths, no magic).
pub const LEGACY_PREFIX_SIZE: usize = 8;

/// Largest frame the signed 32-bit length field can describe.
pub const ABSOLUTE_MAX_FRAME_SIZE: u32 = i32::MAX as u32;

/// Default maximum frame size accepted by the reassembler (1 GB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1_073_741_824;

/// Diagnostic line written to a remote peer that broke the framing.
pub const PROTOCOL_PROBLEM_LINE: &[u8] = b"Protocol problem.\n";

/// Frame layout spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireVersion {
    /// Magic-prefixed layout (canonical).
    #[default]
    Current,
    /// Earlier layout without the magic marker.
    Legacy,
}

impl WireVersion {
    /// Magic marker for this layout, if any.
    #[inline]
    pub fn magic(&self) -> Option<&'static [u8; 4]> {
        match self {
            WireVersion::Current => Some(&MAGIC),
            WireVersion::Legacy => None,
        }
    }

    /// Size of the fixed prefix preceding the header bytes.
    #[inline]
    pub fn prefix_size(&self) -> usize {
        match self {
            WireVersion::Current => PREFIX_SIZE,
            WireVersion::Legacy => LEGACY_PREFIX_SIZE,
        }
    }

    /// Offset of the `total_length` field.
    #[inline]
    pub fn total_length_offset(&self) -> usize {
        self.prefix_size() - 8
    }

    /// Offset of the `header_length` field.
    #[inline]
    pub fn header_length_offset(&self) -> usize {
        self.prefix_size() - 4
    }

    /// Check the magic marker at the start of `buf`.
    ///
    /// Input shorter than the marker passes; the check is repeated once more
    /// bytes have arrived.
    pub fn check_magic(&self, buf: &[u8]) -> Result<()> {
        let Some(magic) = self.magic() else {
            return Ok(());
        };
        match buf.get(..magic.len()) {
            Some(found) if found != &magic[..] => Err(HachiError::ProtocolViolation(format!(
                "bad magic {:02x?}, expected {:02x?}",
                found, magic
            ))),
            _ => Ok(()),
        }
    }

    /// Write the prefix for a frame with the given lengths into `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is smaller than [`prefix_size`](Self::prefix_size).
    pub fn encode_prefix_into(&self, buf: &mut [u8], total_length: u32, header_length: u32) {
        debug_assert!(buf.len() >= self.prefix_size());
        if let Some(magic) = self.magic() {
            buf[..magic.len()].copy_from_slice(magic);
        }
        let total_at = self.total_length_offset();
        let header_at = self.header_length_offset();
        buf[total_at..total_at + 4].copy_from_slice(&total_length.to_le_bytes());
        buf[header_at..header_at + 4].copy_from_slice(&header_length.to_le_bytes());
    }
}

/// Read a little-endian int32 at `offset`.
///
/// Returns `None` if the buffer is too short.
#[inline]
pub fn read_i32_le(buf: &[u8], offset: usize) -> Option<i32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Validate a decoded `(total_length, header_length)` pair.
///
/// Enforces `total_length >= prefix + header_length >= prefix` and the
/// configured maximum frame size. Returns the lengths as `usize`.
pub fn validate_lengths(
    version: WireVersion,
    total_length: i32,
    header_length: i32,
    max_frame_size: u32,
) -> Result<(usize, usize)> {
    if total_length < 0 || header_length < 0 {
        return Err(HachiError::ProtocolViolation(format!(
            "negative length field (total {}, header {})",
            total_length, header_length
        )));
    }

    let total = total_length as usize;
    let header = header_length as usize;
    let prefix = version.prefix_size();

    if total < prefix + header {
        return Err(HachiError::ProtocolViolation(format!(
            "total length {} smaller than prefix {} + header {}",
            total, prefix, header
        )));
    }

    if total_length as u32 > max_frame_size {
        return Err(HachiError::ProtocolViolation(format!(
            "frame size {} exceeds maximum {}",
            total, max_frame_size
        )));
    }

    Ok((total, header))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_sizes() {
        assert_eq!(WireVersion::Current.prefix_size(), 12);
        assert_eq!(WireVersion::Legacy.prefix_size(), 8);
        assert_eq!(WireVersion::default(), WireVersion::Current);
    }

    #[test]
    fn test_field_offsets() {
        assert_eq!(WireVersion::Current.total_length_offset(), 4);
        assert_eq!(WireVersion::Current.header_length_offset(), 8);
        assert_eq!(WireVersion::Legacy.total_length_offset(), 0);
        assert_eq!(WireVersion::Legacy.header_length_offset(), 4);
    }

    #[test]
    fn test_encode_prefix_little_endian() {
        let mut buf = [0u8; PREFIX_SIZE];
        WireVersion::Current.encode_prefix_into(&mut buf, 0x0403_0201, 0x0807_0605);

        assert_eq!(&buf[0..4], b"HNIO");
        assert_eq!(&buf[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&buf[8..12], &[0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn test_encode_legacy_prefix() {
        let mut buf = [0u8; LEGACY_PREFIX_SIZE];
        WireVersion::Legacy.encode_prefix_into(&mut buf, 20, 5);

        assert_eq!(read_i32_le(&buf, 0), Some(20));
        assert_eq!(read_i32_le(&buf, 4), Some(5));
    }

    #[test]
    fn test_check_magic() {
        assert!(WireVersion::Current.check_magic(b"HNIOxxxx").is_ok());

        let err = WireVersion::Current.check_magic(b"GET / HTTP").unwrap_err();
        assert!(matches!(err, HachiError::ProtocolViolation(_)));

        // Legacy frames carry no marker
        assert!(WireVersion::Legacy.check_magic(b"GET ").is_ok());
    }

    #[test]
    fn test_check_magic_short_input() {
        assert!(WireVersion::Current.check_magic(b"").is_ok());
        assert!(WireVersion::Current.check_magic(b"HN").is_ok());
        // Too short to judge, even when already wrong
        assert!(WireVersion::Current.check_magic(b"GE").is_ok());
        assert!(WireVersion::Current.check_magic(b"GET ").is_err());
    }

    #[test]
    fn test_read_i32_le_short_buffer() {
        assert_eq!(read_i32_le(&[1, 2, 3], 0), None);
        assert_eq!(read_i32_le(&[0xff, 0xff, 0xff, 0xff], 0), Some(-1));
    }

    #[test]
    fn test_validate_lengths() {
        let v = WireVersion::Current;
        assert_eq!(validate_lengths(v, 12, 0, DEFAULT_MAX_FRAME_SIZE).unwrap(), (12, 0));
        assert_eq!(validate_lengths(v, 40, 10, DEFAULT_MAX_FRAME_SIZE).unwrap(), (40, 10));

        // Total shorter than prefix + header
        assert!(validate_lengths(v, 11, 0, DEFAULT_MAX_FRAME_SIZE).is_err());
        assert!(validate_lengths(v, 20, 10, DEFAULT_MAX_FRAME_SIZE).is_err());

        // Negative fields
        assert!(validate_lengths(v, -1, 0, DEFAULT_MAX_FRAME_SIZE).is_err());
        assert!(validate_lengths(v, 20, -3, DEFAULT_MAX_FRAME_SIZE).is_err());

        // Over the configured limit
        let err = validate_lengths(v, 1000, 0, 100).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }
}
