//! Pluggable meta codec.
//!
//! The wire contract only requires a byte-length-addressable serializer for
//! the two schema'd messages ([`Meta`] and [`ErrorMessage`]); payloads are
//! opaque bytes owned by the application's own serializer.

use crate::{CodecError, ErrorMessage, Meta};

/// Serializer for the frame meta and the wire error payload.
pub trait MetaCodec: Send + Sync + 'static {
    fn encode_meta(&self, meta: &Meta) -> Result<Vec<u8>, CodecError>;
    fn decode_meta(&self, buf: &[u8]) -> Result<Meta, CodecError>;
    fn encode_error(&self, err: &ErrorMessage) -> Result<Vec<u8>, CodecError>;
    fn decode_error(&self, buf: &[u8]) -> Result<ErrorMessage, CodecError>;
}

/// MessagePack codec, the default.
///
/// Uses named (map) encoding so meta fields stay addressable across
/// versions.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgpackCodec;

impl MetaCodec for MsgpackCodec {
    fn encode_meta(&self, meta: &Meta) -> Result<Vec<u8>, CodecError> {
        rmp_serde::encode::to_vec_named(meta).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_meta(&self, buf: &[u8]) -> Result<Meta, CodecError> {
        rmp_serde::decode::from_slice(buf).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode_error(&self, err: &ErrorMessage) -> Result<Vec<u8>, CodecError> {
        rmp_serde::encode::to_vec_named(err).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_error(&self, buf: &[u8]) -> Result<ErrorMessage, CodecError> {
        rmp_serde::decode::from_slice(buf).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// JSON codec for debugging and external tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MetaCodec for JsonCodec {
    fn encode_meta(&self, meta: &Meta) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(meta).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_meta(&self, buf: &[u8]) -> Result<Meta, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode_error(&self, err: &ErrorMessage) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(err).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_error(&self, buf: &[u8]) -> Result<ErrorMessage, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
