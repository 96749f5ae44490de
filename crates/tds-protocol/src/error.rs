//! Protocol decode/encode errors.
//!
//! Every fallible operation in this crate returns [`ProtocolError`]. The
//! variants carry enough context (expected vs. actual length, the offending
//! byte) to build a useful diagnostic at the caller without re-reading the
//! buffer.

#[cfg(not(feature = "std"))]
use alloc::string::String;

/// Errors produced while decoding or encoding TDS wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Buffer ran out of bytes mid-decode with no further detail available.
    #[error("unexpected end of buffer")]
    UnexpectedEof,

    /// Buffer held fewer bytes than a length-prefixed field declared.
    #[error("incomplete packet: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Bytes the field declared it needed.
        expected: usize,
        /// Bytes actually remaining in the buffer.
        actual: usize,
    },

    /// A token type byte did not match any known [`crate::token::TokenType`].
    #[error("invalid or unhandled token type: 0x{0:02X}")]
    InvalidTokenType(u8),

    /// A packet type byte did not match any known [`crate::packet::PacketType`].
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// A packet status byte did not match any known [`crate::packet::PacketStatus`] bits.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// A PRELOGIN option token did not match any known option kind.
    #[error("invalid prelogin option: 0x{0:02X}")]
    InvalidPreloginOption(u8),

    /// A named field held a value outside its expected domain.
    #[error("invalid value for field {field}: {value}")]
    InvalidField {
        /// Name of the field that failed validation.
        field: &'static str,
        /// The out-of-domain value that was read.
        value: u32,
    },

    /// A length-prefixed string was not valid UTF-16.
    #[error("string encoding error: {0}")]
    StringEncoding(String),
}
