//! Error types shared by the three codecs.

use thiserror::Error;

/// Framing-level errors raised while decoding a byte stream.
///
/// These are *local* errors: an engine answers them with the
/// protocol-appropriate negative signal (or ignores them) and keeps the
/// connection alive, except where noted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A VideoHub text block grew past the per-block cap without a
    /// terminating blank line. Fatal for the connection.
    #[error("text block exceeds {max} bytes without terminator")]
    BlockTooLarge { max: usize },

    /// A VideoHub block contained bytes that are not valid UTF-8.
    #[error("invalid UTF-8 in text block")]
    InvalidUtf8,

    /// SW-P-08 byte-count field disagrees with the received frame.
    #[error("byte count mismatch: BTC says {expected}, frame carries {actual}")]
    ByteCountMismatch { expected: usize, actual: usize },

    /// Checksum verification failed (SW-P-08 two's-complement or
    /// GV Native hex checksum).
    #[error("checksum mismatch: computed 0x{computed:02X}, received 0x{received:02X}")]
    ChecksumMismatch { computed: u8, received: u8 },

    /// A frame ended before the minimum payload was present.
    #[error("frame truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Binary frame exceeded the maximum allowed payload size.
    #[error("frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),

    /// An address does not fit the wire encoding in use.
    #[error("address {0} out of range for {1} encoding")]
    AddressRange(u32, &'static str),

    /// The frame verified but its contents could not be interpreted.
    #[error("malformed message: {0}")]
    Malformed(String),
}
