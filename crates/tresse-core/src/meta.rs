//! Frame meta message and packet flags.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Whether a frame carries a request or a response.
///
/// A connection is full-duplex symmetric: either endpoint may send REQUEST
/// frames, so the packet type (together with the transmission id) is what
/// routes a frame to the right context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    Request = 1,
    Response = 2,
}

bitflags! {
    /// Flags carried in each frame meta.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PacketFlags: u32 {
        /// Final message of a logical stream of requests or responses.
        ///
        /// The sender MUST NOT send more data frames for the same
        /// transmission id after this.
        const END_STREAM = 0b0000_0001;

        /// The sending side aborted the call; the payload is an
        /// [`ErrorMessage`].
        const CANCEL     = 0b0000_0010;
    }
}

/// Per-frame meta, serialized by the connection's [`MetaCodec`].
///
/// `transmission_id` correlates a request with its response(s). Ids are
/// allocated from two disjoint monotonic counters, one per endpoint: the
/// connection-initiating side uses odd ids (1, 3, 5, ...), the accepting
/// side even ids (2, 4, 6, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub transmission_id: u32,
    /// Full method name. Only meaningful on request frames; empty otherwise.
    #[serde(default)]
    pub service_method: String,
    pub packet_type: PacketType,
    pub packet_flags: PacketFlags,
    /// Set on a response whose payload is an [`ErrorMessage`].
    #[serde(default)]
    pub is_failed: bool,
}

impl Meta {
    /// A request frame for the given method.
    pub fn request(transmission_id: u32, service_method: impl Into<String>) -> Self {
        Self {
            transmission_id,
            service_method: service_method.into(),
            packet_type: PacketType::Request,
            packet_flags: PacketFlags::empty(),
            is_failed: false,
        }
    }

    /// A response frame.
    pub fn response(transmission_id: u32) -> Self {
        Self {
            transmission_id,
            service_method: String::new(),
            packet_type: PacketType::Response,
            packet_flags: PacketFlags::empty(),
            is_failed: false,
        }
    }

    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.packet_flags = flags;
        self
    }

    pub fn failed(mut self) -> Self {
        self.is_failed = true;
        self
    }

    #[inline]
    pub fn is_end_stream(&self) -> bool {
        self.packet_flags.contains(PacketFlags::END_STREAM)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.packet_flags.contains(PacketFlags::CANCEL)
    }
}

/// Wire error payload, carried by `is_failed` responses and CANCEL frames.
///
/// `data` is JSON text with structured error details, or empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: u32,
    pub message: String,
    #[serde(default)]
    pub data: String,
}
