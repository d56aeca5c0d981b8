//! Wire-level error types.
//!
//! All of these are `Clone`: when a connection dies, the same close reason
//! fans out to every outstanding context, so reasons must be shareable.

use core::fmt;
use std::sync::Arc;

/// Transport-level errors.
#[derive(Debug, Clone)]
pub enum TransportError {
    Closed,
    Io(Arc<std::io::Error>),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Meta codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    Encode(String),
    Decode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(msg) => write!(f, "encode failed: {msg}"),
            Self::Decode(msg) => write!(f, "decode failed: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Framing errors. Fatal to the connection; there is no partial recovery
/// from a corrupt or oversized frame on a byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared payload size exceeds the configured maximum.
    PacketTooLarge { size: usize, max: usize },
    /// Meta bytes exceed the u16 length space of the frame header.
    MetaTooLarge { size: usize },
    Codec(CodecError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge { size, max } => {
                write!(f, "packet payload {size} bytes exceeds max {max}")
            }
            Self::MetaTooLarge { size } => {
                write!(f, "frame meta {size} bytes exceeds header length space")
            }
            Self::Codec(e) => write!(f, "framing codec error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for ProtocolError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}
