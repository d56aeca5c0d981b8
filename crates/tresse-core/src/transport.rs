//! Transport traits and type-erased wrappers.
//!
//! Concrete transports (TCP, unix sockets, in-process pairs) live in their
//! own crates and implement [`Transport`]. The engine consumes transports
//! through [`AnyTransport`], and listening sockets through [`Listener`].
//!
//! The surface is a byte stream, not frames: framing belongs to the
//! connection, which accumulates received chunks and runs the [`Protocol`]
//! over them.
//!
//! [`Protocol`]: crate::Protocol

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::TransportError;

/// A full-duplex byte-stream transport.
///
/// Uses RPITIT for async methods, enabling zero-cost use when the concrete
/// type is known at compile time; see [`AnyTransport`] for type erasure.
///
/// The write side is split into a non-blocking attempt ([`try_send`]) and a
/// readiness wait ([`send_ready`]) so the connection can send directly when
/// the transport has room and buffer only the remainder.
///
/// [`try_send`]: Transport::try_send
/// [`send_ready`]: Transport::send_ready
pub trait Transport: Send + Sync + Clone + 'static {
    /// Receive the next chunk of bytes.
    ///
    /// An empty chunk signals EOF: the peer half-closed its write side.
    fn recv(&self) -> impl Future<Output = Result<Bytes, TransportError>> + Send + '_;

    /// Attempt a non-blocking write; returns the number of bytes accepted.
    /// Zero means the transport cannot take more right now.
    fn try_send(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Resolves once the transport can accept more bytes.
    fn send_ready(&self) -> impl Future<Output = Result<(), TransportError>> + Send + '_;

    /// Close this transport. After closing, `recv` and the send side return
    /// [`TransportError::Closed`].
    fn close(&self);

    /// Check if this transport is closed.
    fn is_closed(&self) -> bool;
}

/// Object-safe version of [`Transport`] for dynamic dispatch.
///
/// This trait boxes the async methods, enabling use with `dyn DynTransport`.
/// Use [`AnyTransport`] as a convenient wrapper.
pub trait DynTransport: Send + Sync + 'static {
    fn recv_dyn(&self)
    -> Pin<Box<dyn Future<Output = Result<Bytes, TransportError>> + Send + '_>>;

    fn try_send_dyn(&self, data: &[u8]) -> Result<usize, TransportError>;

    fn send_ready_dyn(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Blanket impl: any `Transport` can be used as `DynTransport`.
impl<T: Transport> DynTransport for T {
    fn recv_dyn(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, TransportError>> + Send + '_>> {
        Box::pin(self.recv())
    }

    fn try_send_dyn(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.try_send(data)
    }

    fn send_ready_dyn(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(self.send_ready())
    }

    fn close(&self) {
        Transport::close(self)
    }

    fn is_closed(&self) -> bool {
        Transport::is_closed(self)
    }
}

/// Type-erased transport handle.
///
/// Wraps any [`Transport`] in an `Arc<dyn DynTransport>`, giving the engine
/// one concrete type it can clone into reader and flusher tasks. The extra
/// vtable hop is negligible next to actual I/O.
#[derive(Clone)]
pub struct AnyTransport {
    inner: Arc<dyn DynTransport>,
}

impl std::fmt::Debug for AnyTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyTransport")
            .field("is_closed", &self.inner.is_closed())
            .finish_non_exhaustive()
    }
}

impl AnyTransport {
    /// Create a type-erased handle from any [`Transport`] implementation.
    pub fn new<T: Transport>(transport: T) -> Self {
        Self {
            inner: Arc::new(transport),
        }
    }

    pub async fn recv(&self) -> Result<Bytes, TransportError> {
        self.inner.recv_dyn().await
    }

    pub fn try_send(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.inner.try_send_dyn(data)
    }

    pub async fn send_ready(&self) -> Result<(), TransportError> {
        self.inner.send_ready_dyn().await
    }

    pub fn close(&self) {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// A listening socket producing accepted transports.
///
/// Object-safe so the channel can own a heterogeneous listener set.
pub trait Listener: Send + Sync + 'static {
    /// Accept the next pending connection.
    ///
    /// Returns the accepted transport and a peer description for logging.
    fn accept(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(AnyTransport, String), TransportError>> + Send + '_>>;

    /// The bound local address, if known.
    fn local_addr(&self) -> Option<String>;

    /// Stop accepting and release the socket.
    fn close(&self);
}
