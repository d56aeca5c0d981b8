//! tresse-core: Wire types and traits for the tresse RPC engine.
//!
//! This crate defines:
//! - The frame meta message ([`Meta`], [`PacketType`], [`PacketFlags`])
//! - The pluggable meta codec ([`MetaCodec`], [`MsgpackCodec`], [`JsonCodec`])
//! - Length-prefixed framing ([`Protocol`])
//! - Transport traits ([`Transport`], [`DynTransport`], [`AnyTransport`],
//!   [`Listener`])
//! - Wire-level errors ([`TransportError`], [`CodecError`], [`ProtocolError`])

#![forbid(unsafe_code)]

mod codec;
mod error;
mod meta;
mod protocol;
mod transport;

pub use codec::*;
pub use error::*;
pub use meta::*;
pub use protocol::*;
pub use transport::*;
