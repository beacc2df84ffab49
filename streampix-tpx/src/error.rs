//! Wire-format error types.

use thiserror::Error;

/// Result type for decode operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while decoding 64-bit stream words.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Pixel decode was invoked on a word that is neither 0xA nor 0xB.
    #[error("invalid pixel packet type: {0:#x}")]
    InvalidPixelType(u8),

    /// TDC fine timestamp outside the valid 1..=12 range.
    #[error("invalid fractional TDC part: {0}")]
    InvalidFractional(u8),

    /// TDC subtype nibble not one of the four known edges.
    #[error("invalid TDC event type: {0:#x}")]
    InvalidTdcType(u8),

    /// Neither the top byte nor the top nibble matches a known packet.
    #[error("unknown packet type: {0:#04x}")]
    UnknownPacket(u8),

    /// Chunk header with a size that is zero or not a multiple of 8.
    #[error("invalid chunk size: {0} bytes")]
    InvalidChunkSize(u16),
}

impl Error {
    /// True for the TDC fine-timestamp error, which has its own counter.
    pub fn is_fractional(&self) -> bool {
        matches!(self, Error::InvalidFractional(_))
    }
}
