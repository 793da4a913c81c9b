//! Error types for the wire protocol and server lifecycle

use thiserror::Error;

use crate::protocol::MAX_PAYLOAD_LEN;

/// Errors produced while decoding wire protocol data.
///
/// Any of these on a live connection triggers the resync policy: the
/// connection's receive ring is cleared and the stream continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The first four header bytes did not match the protocol magic
    #[error("bad magic 0x{found:08x}")]
    BadMagic { found: u32 },

    /// Declared payload length exceeds the protocol maximum
    #[error("payload length {len} exceeds maximum {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge { len: u32 },

    /// Header CRC did not match the recomputed value
    #[error("header crc mismatch (computed 0x{computed:04x}, found 0x{found:04x})")]
    CrcMismatch { computed: u16, found: u16 },

    /// Not enough bytes for the declared message
    #[error("truncated message ({have} of {need} bytes)")]
    Truncated { need: usize, have: usize },
}

/// Errors surfaced by server lifecycle operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address string could not be parsed
    #[error("invalid listen address {addr:?}")]
    InvalidAddr { addr: String },

    /// Binding or listening on the configured endpoint failed
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
