//! tresse: Multiplexed full-duplex streaming RPC over one byte stream.
//!
//! A length-prefixed, multiplexed protocol runs over a single transport
//! connection. Either endpoint may initiate calls; the four call shapes
//! (unary-unary, unary-stream, stream-unary, stream-stream) are enforced
//! message-by-message per call.
//!
//! # Quick start
//!
//! Register methods in a [`Router`], open a [`Channel`], and call through a
//! [`MethodStub`]:
//!
//! ```ignore
//! use tresse::prelude::*;
//!
//! let router = Router::builder()
//!     .route(Method::new("echo.Echo.Unary", CallKind::UnaryUnary, |ctx| async move {
//!         let request = ctx.recv_message().await?.unwrap_or_default();
//!         ctx.send_message(request, false).await?;
//!         Ok(())
//!     }))
//!     .build();
//!
//! let channel = Channel::new("server", router, ChannelConfig::default());
//! channel.listen(TcpListenerAdapter::bind("0.0.0.0:8888").await?);
//! channel.start()?;
//!
//! // Client side: wrap a dialed transport and invoke the stub.
//! let client = Channel::new("client", Router::empty(), ChannelConfig::default());
//! let conn = client.connect(AnyTransport::new(TcpTransport::connect("127.0.0.1:8888").await?))?;
//! let stub = MethodStub::unary_unary("echo.Echo.Unary");
//! let reply = stub.unary(&conn, Bytes::from_static(b"hello")).await?;
//! ```
//!
//! # Dispatch policies
//!
//! Each connection schedules its inbound call tasks through one of two
//! interchangeable policies ([`DispatchMode`]): serial dispatch awaits every
//! task to completion in strict FIFO order, parallel dispatch runs tasks
//! through a bounded [`WorkerPool`]. Per-context message order is preserved
//! under both, because frames are fed into contexts synchronously on the
//! reader before any task yields.
//!
//! # Errors
//!
//! Framing and protocol-discipline errors tear the whole connection down; a
//! [`CallError`] returned by a method implementation becomes a structured
//! error response and the connection stays open; a timeout resolves only the
//! context that timed out. See [`RpcError`].

#![forbid(unsafe_code)]

pub mod channel;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod handler;
pub mod manager;
pub mod method;
pub mod middleware;
pub mod router;
pub mod worker;

pub use channel::{Channel, ChannelState};
pub use config::{ChannelConfig, ConnectionConfig, DispatchMode};
pub use connection::Connection;
pub use context::{Direction, InboundContext, OutboundContext};
pub use error::{CallError, ContractViolation, ErrorRegistry, RpcError, code};
pub use handler::{Handler, ParallelHandler, SerialHandler};
pub use manager::{ContextManager, MAX_TRANSMISSION_ID, Role};
pub use method::{CallKind, Method, MethodDesc, MethodStub};
pub use middleware::{Middleware, MiddlewareManager};
pub use router::{Router, RouterBuilder};
pub use worker::{PoolError, WorkerPool};

// Re-export the wire layer so downstream code rarely needs tresse-core
// directly.
pub use tresse_core::{
    AnyTransport, CodecError, ErrorMessage, JsonCodec, Listener, Meta, MetaCodec, MsgpackCodec,
    PacketFlags, PacketType, Protocol, ProtocolError, Transport, TransportError,
};

/// The commonly needed surface in one import.
pub mod prelude {
    pub use bytes::Bytes;

    pub use crate::channel::{Channel, ChannelState};
    pub use crate::config::{ChannelConfig, ConnectionConfig, DispatchMode};
    pub use crate::connection::Connection;
    pub use crate::context::{InboundContext, OutboundContext};
    pub use crate::error::{CallError, RpcError};
    pub use crate::method::{CallKind, Method, MethodStub};
    pub use crate::router::Router;
    pub use tresse_core::{AnyTransport, Listener, Transport};
}
