//! Length-prefixed wire framing.
//!
//! ```text
//! +------------------+-------------------+--------------+-----------------+
//! | meta_size (u16)  | payload_size (u16)| meta (bytes) | payload (bytes) |
//! +------------------+-------------------+--------------+-----------------+
//! ```
//!
//! Header is 4 bytes, big-endian. The meta is codec-serialized; the payload
//! is opaque application bytes.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{ErrorMessage, Meta, MetaCodec, ProtocolError};

/// Fixed frame header size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Default ceiling for a single frame's payload.
pub const DEFAULT_MAX_PACKET: usize = 8 * 1024;

/// Wire framing: splits a byte stream into (meta, payload) frames and
/// encodes the reverse direction.
#[derive(Clone)]
pub struct Protocol {
    codec: Arc<dyn MetaCodec>,
    max_packet: usize,
}

impl Protocol {
    pub fn new(codec: Arc<dyn MetaCodec>) -> Self {
        Self::with_max_packet(codec, DEFAULT_MAX_PACKET)
    }

    pub fn with_max_packet(codec: Arc<dyn MetaCodec>, max_packet: usize) -> Self {
        // payload_size travels as u16
        let max_packet = max_packet.min(u16::MAX as usize);
        Self { codec, max_packet }
    }

    pub fn max_packet(&self) -> usize {
        self.max_packet
    }

    pub fn codec(&self) -> &Arc<dyn MetaCodec> {
        &self.codec
    }

    /// Encode one frame.
    pub fn encode(&self, meta: &Meta, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.len() > self.max_packet {
            return Err(ProtocolError::PacketTooLarge {
                size: payload.len(),
                max: self.max_packet,
            });
        }
        let meta_bytes = self.codec.encode_meta(meta)?;
        if meta_bytes.len() > u16::MAX as usize {
            return Err(ProtocolError::MetaTooLarge {
                size: meta_bytes.len(),
            });
        }
        let mut out = BytesMut::with_capacity(HEADER_SIZE + meta_bytes.len() + payload.len());
        out.put_u16(meta_bytes.len() as u16);
        out.put_u16(payload.len() as u16);
        out.put_slice(&meta_bytes);
        out.put_slice(payload);
        Ok(out.freeze())
    }

    /// Encode an error frame, serializing the wire error as the payload.
    pub fn encode_error(&self, meta: &Meta, err: &ErrorMessage) -> Result<Bytes, ProtocolError> {
        let payload = self.codec.encode_error(err)?;
        self.encode(meta, &payload)
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Resumable: returns `Ok(None)` when the buffer holds less than one
    /// complete frame; the caller accumulates more bytes and retries. A
    /// declared payload size above the configured maximum is fatal.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(usize, Meta, Bytes)>, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let meta_size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let payload_size = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if payload_size > self.max_packet {
            return Err(ProtocolError::PacketTooLarge {
                size: payload_size,
                max: self.max_packet,
            });
        }
        let total = HEADER_SIZE + meta_size + payload_size;
        if buf.len() < total {
            return Ok(None);
        }
        let meta = self.codec.decode_meta(&buf[HEADER_SIZE..HEADER_SIZE + meta_size])?;
        let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE + meta_size..total]);
        Ok(Some((total, meta, payload)))
    }

    /// Drain all fully available frames from `buf` in one pass.
    pub fn feed(&self, buf: &mut BytesMut) -> Result<Vec<(Meta, Bytes)>, ProtocolError> {
        let mut frames = Vec::new();
        let mut used = 0;
        while let Some((consumed, meta, payload)) = self.decode(&buf[used..])? {
            frames.push((meta, payload));
            used += consumed;
        }
        if used > 0 {
            buf.advance(used);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MsgpackCodec, PacketFlags};

    fn protocol() -> Protocol {
        Protocol::new(Arc::new(MsgpackCodec))
    }

    #[test]
    fn encode_decode_round_trip() {
        let p = protocol();
        let meta = Meta::request(3, "math.Adder.Add").with_flags(PacketFlags::END_STREAM);
        let payload = b"hello world".as_slice();

        let wire = p.encode(&meta, payload).unwrap();
        let (consumed, decoded, body) = p.decode(&wire).unwrap().unwrap();

        assert_eq!(consumed, wire.len());
        assert_eq!(decoded, meta);
        assert_eq!(&body[..], payload);
    }

    #[test]
    fn empty_payload_round_trip() {
        let p = protocol();
        let meta = Meta::response(4).with_flags(PacketFlags::END_STREAM);
        let wire = p.encode(&meta, &[]).unwrap();
        let (consumed, decoded, body) = p.decode(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(decoded, meta);
        assert!(body.is_empty());
    }

    #[test]
    fn short_buffer_is_resumable() {
        let p = protocol();
        let meta = Meta::request(1, "echo.Echo.Unary");
        let wire = p.encode(&meta, b"payload").unwrap();

        // Every prefix shorter than the full frame decodes to None.
        for cut in 0..wire.len() {
            assert!(p.decode(&wire[..cut]).unwrap().is_none(), "cut at {cut}");
        }
    }

    #[test]
    fn feed_batches_all_complete_frames() {
        let p = protocol();
        let mut buf = BytesMut::new();
        for id in 1..=3u32 {
            let meta = Meta::request(id, "echo.Echo.Unary");
            buf.extend_from_slice(&p.encode(&meta, format!("m{id}").as_bytes()).unwrap());
        }
        // Trailing partial frame stays in the buffer.
        let tail = p.encode(&Meta::request(9, "echo.Echo.Unary"), b"tail").unwrap();
        buf.extend_from_slice(&tail[..tail.len() - 2]);

        let frames = p.feed(&mut buf).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames.iter().map(|(m, _)| m.transmission_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(buf.len(), tail.len() - 2);

        // Completing the partial frame yields it on the next pass.
        buf.extend_from_slice(&tail[tail.len() - 2..]);
        let frames = p.feed(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.transmission_id, 9);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_payload_is_fatal_on_decode() {
        let small = Protocol::with_max_packet(Arc::new(MsgpackCodec), 16);
        // Header declaring a 17-byte payload is enough to trip the check,
        // even before the payload bytes arrive.
        let mut header = BytesMut::new();
        header.put_u16(1);
        header.put_u16(17);
        assert!(matches!(
            small.decode(&header),
            Err(ProtocolError::PacketTooLarge { size: 17, max: 16 })
        ));
    }

    #[test]
    fn oversized_payload_is_rejected_on_encode() {
        let small = Protocol::with_max_packet(Arc::new(MsgpackCodec), 16);
        let meta = Meta::request(1, "echo.Echo.Unary");
        assert!(matches!(
            small.encode(&meta, &[0u8; 17]),
            Err(ProtocolError::PacketTooLarge { .. })
        ));
    }
}
