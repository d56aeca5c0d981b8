//! tresse-transport-mem: In-process transport for tresse.
//!
//! This is the semantic reference implementation. All other transports must
//! behave identically to this one; if behavior differs, the other transport
//! has a bug.
//!
//! Byte chunks are passed through async channels. The write side never
//! blocks (the channel is unbounded), so `try_send` always accepts the full
//! chunk and `send_ready` resolves immediately.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tresse_core::{Transport, TransportError};

/// In-process transport implementation.
#[derive(Clone)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

struct MemInner {
    /// Chunks headed to the peer.
    tx: mpsc::UnboundedSender<Bytes>,
    /// Chunks arriving from the peer (async mutex: held across recv).
    rx: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: AtomicBool,
}

impl MemTransport {
    /// Create a connected pair of in-process transports.
    ///
    /// Returns (A, B) where chunks sent on A are received on B and vice
    /// versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            inner: Arc::new(MemInner {
                tx: tx_b,
                rx: AsyncMutex::new(rx_a),
                closed: AtomicBool::new(false),
            }),
        };
        let b = Self {
            inner: Arc::new(MemInner {
                tx: tx_a,
                rx: AsyncMutex::new(rx_b),
                closed: AtomicBool::new(false),
            }),
        };
        (a, b)
    }
}

impl Transport for MemTransport {
    async fn recv(&self) -> Result<Bytes, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let chunk = {
            let mut rx = self.inner.rx.lock().await;
            rx.recv().await
        };
        // A dropped or closed peer reads as EOF, same as a half-closed
        // socket.
        Ok(chunk.unwrap_or_default())
    }

    fn try_send(&self, data: &[u8]) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.inner
            .tx
            .send(Bytes::copy_from_slice(data))
            .map(|_| data.len())
            .map_err(|_| TransportError::Closed)
    }

    async fn send_ready(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            // Empty chunk = EOF marker for the peer.
            let _ = self.inner.tx.send(Bytes::new());
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_cross_the_pair() {
        let (a, b) = MemTransport::pair();
        assert_eq!(a.try_send(b"ping").unwrap(), 4);
        assert_eq!(&b.recv().await.unwrap()[..], b"ping");

        assert_eq!(b.try_send(b"pong").unwrap(), 4);
        assert_eq!(&a.recv().await.unwrap()[..], b"pong");
    }

    #[tokio::test]
    async fn close_reads_as_eof_on_the_peer() {
        let (a, b) = MemTransport::pair();
        a.close();
        assert!(a.is_closed());
        assert!(b.recv().await.unwrap().is_empty());
        assert!(matches!(a.try_send(b"x"), Err(TransportError::Closed)));
    }
}
