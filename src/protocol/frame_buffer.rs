//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management. The buffer tracks
//! two pieces of in-progress state:
//! - `pending_message_length`: `total_length` of the frame being assembled
//!   (0 while no length prefix has been read)
//! - `pending_header_length`: `header_length` of that frame
//!
//! Both reset to 0 every time a complete frame is extracted. A magic mismatch
//! or inconsistent lengths poison the buffer: every later push fails, since
//! the stream cannot be resynchronized.
//!
//! # Example
//!
//! ```
//! use hachi_nio::protocol::{encode, FrameBuffer};
//! use hachi_nio::Header;
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = encode(&Header::with_transaction("PING"), b"data").unwrap();
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(&bytes[..5]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[5..]).unwrap();
//!
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].payload(), b"data");
//! ```

use bytes::BytesMut;

use super::wire_format::{read_i32_le, validate_lengths, WireVersion, DEFAULT_MAX_FRAME_SIZE};
use super::Frame;
use crate::error::{HachiError, Result};

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Owned by exactly one connection and mutated only through `push`.
pub struct FrameBuffer {
    /// Accumulated, not yet consumed bytes from socket reads.
    buffer: BytesMut,
    /// `total_length` of the in-progress frame, 0 if unknown.
    pending_message_length: usize,
    /// `header_length` of the in-progress frame.
    pending_header_length: usize,
    /// Frame layout spoken on this connection.
    version: WireVersion,
    /// Maximum allowed frame size.
    max_frame_size: u32,
    /// Set once the framing is broken.
    poisoned: bool,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max frame: 1GB, current wire version.
    pub fn new() -> Self {
        Self::with_version(WireVersion::Current)
    }

    /// Create a new frame buffer for the given wire version.
    pub fn with_version(version: WireVersion) -> Self {
        Self::with_config(version, 64 * 1024, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with custom max frame size.
    pub fn with_max_frame(max_frame_size: u32) -> Self {
        Self::with_config(WireVersion::Current, 64 * 1024, max_frame_size)
    }

    /// Create a new frame buffer with explicit version, capacity and limit.
    pub fn with_config(version: WireVersion, capacity: usize, max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            pending_message_length: 0,
            pending_header_length: 0,
            version,
            max_frame_size,
            poisoned: false,
        }
    }

    /// Push data into the buffer and collect all complete frames.
    ///
    /// Frames extracted before a protocol violation in the same chunk are
    /// discarded together with the error; use [`push_with`](Self::push_with)
    /// to observe them.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        self.push_with(data, |frame| frames.push(frame))?;
        Ok(frames)
    }

    /// Push data into the buffer and hand every complete frame to `sink`.
    ///
    /// This is the main API for processing incoming data from the socket.
    /// Frames are delivered in arrival order, each exactly once. Returns the
    /// number of frames extracted.
    ///
    /// # Errors
    ///
    /// Returns [`HachiError::ProtocolViolation`] on a magic mismatch, an
    /// inconsistent length prefix, or a frame above the size limit. The
    /// buffer stays poisoned afterwards.
    pub fn push_with<F>(&mut self, data: &[u8], mut sink: F) -> Result<usize>
    where
        F: FnMut(Frame),
    {
        if self.poisoned {
            return Err(HachiError::ProtocolViolation(
                "stream already desynchronized".to_string(),
            ));
        }

        self.buffer.extend_from_slice(data);

        let mut extracted = 0;
        loop {
            match self.step() {
                Ok(Some(frame)) => {
                    sink(frame);
                    extracted += 1;
                }
                Ok(None) => return Ok(extracted),
                Err(e) => {
                    self.poisoned = true;
                    return Err(e);
                }
            }
        }
    }

    /// Run one pass over the buffered bytes.
    ///
    /// Returns a frame if one became complete, `None` if no progress is
    /// possible until more data arrives.
    fn step(&mut self) -> Result<Option<Frame>> {
        let version = self.version;
        let prefix = version.prefix_size();

        // Magic is validated for every frame whose length is still unknown
        if self.pending_message_length == 0 {
            if let Some(magic) = version.magic() {
                if self.buffer.len() >= magic.len() {
                    version.check_magic(&self.buffer)?;
                }
            }
        }

        if self.pending_message_length == 0 {
            if let Some(total) = read_i32_le(&self.buffer, version.total_length_offset()) {
                if total < prefix as i32 {
                    return Err(HachiError::ProtocolViolation(format!(
                        "total length {} smaller than prefix {}",
                        total, prefix
                    )));
                }
                if total as u32 > self.max_frame_size {
                    return Err(HachiError::ProtocolViolation(format!(
                        "frame size {} exceeds maximum {}",
                        total, self.max_frame_size
                    )));
                }
                self.pending_message_length = total as usize;
            }
        }

        if let Some(header) = read_i32_le(&self.buffer, version.header_length_offset()) {
            let (_, header) = validate_lengths(
                version,
                self.pending_message_length as i32,
                header,
                self.max_frame_size,
            )?;
            self.pending_header_length = header;
        }

        if self.pending_message_length == 0 || self.buffer.len() < self.pending_message_length {
            return Ok(None);
        }

        let total = self.pending_message_length;
        let header_len = self.pending_header_length;
        self.pending_message_length = 0;
        self.pending_header_length = 0;

        // Consume exactly one frame, zero-copy
        let mut frame_bytes = self.buffer.split_to(total);
        let _ = frame_bytes.split_to(prefix);
        let header = frame_bytes.split_to(header_len).freeze();
        let payload = frame_bytes.freeze();

        tracing::trace!(
            header_len = header.len(),
            payload_len = payload.len(),
            "recognized frame"
        );

        Ok(Some(Frame::new(header, payload)))
    }

    /// Wire version this buffer parses.
    pub fn version(&self) -> WireVersion {
        self.version
    }

    /// `total_length` of the in-progress frame, 0 if unknown.
    pub fn pending_message_length(&self) -> usize {
        self.pending_message_length
    }

    /// `header_length` of the in-progress frame.
    pub fn pending_header_length(&self) -> usize {
        self.pending_header_length
    }

    /// Whether a protocol violation has been seen.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state, including poisoning.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending_message_length = 0;
        self.pending_header_length = 0;
        self.poisoned = false;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
