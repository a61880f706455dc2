//! Error types for hachi-nio.

use thiserror::Error;

/// Main error type for all hachi-nio operations.
#[derive(Debug, Error)]
pub enum HachiError {
    /// I/O error from the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header document could not be parsed or serialized.
    #[error("Header parse error: {0}")]
    HeaderParse(#[from] serde_json::Error),

    /// Framing is broken (bad magic, inconsistent lengths). Connection-fatal.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Header or payload does not fit in the 32-bit length fields.
    #[error("Frame too large: {size} bytes exceeds maximum {max}")]
    Oversize {
        /// Size the frame would have had.
        size: u64,
        /// Largest size the length field can carry.
        max: u64,
    },

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Send attempted after the peer's stream was closed.
    #[error("Peer {0} is closed")]
    WriteOnClosedPeer(String),

    /// Invalid builder configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HachiError {
    /// Copy of this error for fan-out to several observers.
    ///
    /// `std::io::Error` is not `Clone`, so I/O errors keep their kind and message.
    pub(crate) fn duplicate(&self) -> HachiError {
        match self {
            HachiError::Io(e) => HachiError::Io(std::io::Error::new(e.kind(), e.to_string())),
            HachiError::HeaderParse(e) => HachiError::HeaderParse(serde_json::Error::io(
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
            )),
            HachiError::ProtocolViolation(m) => HachiError::ProtocolViolation(m.clone()),
            HachiError::Oversize { size, max } => HachiError::Oversize {
                size: *size,
                max: *max,
            },
            HachiError::Tls(m) => HachiError::Tls(m.clone()),
            HachiError::WriteOnClosedPeer(id) => HachiError::WriteOnClosedPeer(id.clone()),
            HachiError::InvalidConfig(m) => HachiError::InvalidConfig(m.clone()),
        }
    }
}

/// Result type alias using HachiError.
pub type Result<T> = std::result::Result<T, HachiError>;
