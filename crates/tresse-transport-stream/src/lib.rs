//! tresse-transport-stream: TCP/Unix socket transport for tresse.
//!
//! For cross-machine or cross-container communication (TCP), and for
//! same-host peers where a filesystem path beats a port (Unix sockets).
//!
//! Uses tokio's readiness API (`readable`/`try_read`, `writable`/`try_write`)
//! rather than buffered `AsyncWrite`: the connection layer wants to push
//! bytes directly while the socket has room and queue only the remainder,
//! so the transport must expose non-blocking partial writes.

#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Notify;
use tresse_core::{AnyTransport, Listener, Transport, TransportError};

#[cfg(unix)]
pub use unix::{UnixListenerAdapter, UnixTransport};

/// Bytes asked from the socket per read wake-up.
const MAX_RECV: usize = 256 * 1024;

/// TCP transport implementation.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    stream: TcpStream,
    closed: AtomicBool,
    close_signal: Notify,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            inner: Arc::new(TcpInner {
                stream,
                closed: AtomicBool::new(false),
                close_signal: Notify::new(),
            }),
        }
    }

    /// Dial `addr` and wrap the resulting stream.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.stream.local_addr().ok()
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.stream.peer_addr().ok()
    }
}

impl Transport for TcpTransport {
    async fn recv(&self) -> Result<Bytes, TransportError> {
        loop {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            tokio::select! {
                _ = self.inner.close_signal.notified() => return Err(TransportError::Closed),
                ready = self.inner.stream.readable() => ready?,
            }
            let mut buf = vec![0u8; MAX_RECV];
            match self.inner.stream.try_read(&mut buf) {
                // EOF from the peer.
                Ok(0) => return Ok(Bytes::new()),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Bytes::from(buf));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn try_send(&self, data: &[u8]) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.inner.stream.try_write(data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn send_ready(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            _ = self.inner.close_signal.notified() => Err(TransportError::Closed),
            ready = self.inner.stream.writable() => Ok(ready?),
        }
    }

    fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.close_signal.notify_waiters();
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// [`Listener`] adapter over a bound [`TcpListener`].
pub struct TcpListenerAdapter {
    listener: TcpListener,
    closed: AtomicBool,
    close_signal: Notify,
}

impl TcpListenerAdapter {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    /// Bind `addr` and wrap the listener.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }
}

impl Listener for TcpListenerAdapter {
    fn accept(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(AnyTransport, String), TransportError>> + Send + '_>>
    {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            let (stream, peer) = tokio::select! {
                _ = self.close_signal.notified() => return Err(TransportError::Closed),
                accepted = self.listener.accept() => accepted?,
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "set_nodelay failed on accepted socket");
            }
            Ok((
                AnyTransport::new(TcpTransport::new(stream)),
                peer.to_string(),
            ))
        })
    }

    fn local_addr(&self) -> Option<String> {
        self.listener.local_addr().ok().map(|a| a.to_string())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_signal.notify_waiters();
        }
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use tokio::net::{UnixListener, UnixStream};

    /// Unix domain socket transport implementation.
    #[derive(Clone)]
    pub struct UnixTransport {
        inner: Arc<UnixInner>,
    }

    struct UnixInner {
        stream: UnixStream,
        closed: AtomicBool,
        close_signal: Notify,
    }

    impl UnixTransport {
        pub fn new(stream: UnixStream) -> Self {
            Self {
                inner: Arc::new(UnixInner {
                    stream,
                    closed: AtomicBool::new(false),
                    close_signal: Notify::new(),
                }),
            }
        }

        /// Dial the socket at `path` and wrap the resulting stream.
        pub async fn connect(path: impl AsRef<std::path::Path>) -> Result<Self, TransportError> {
            Ok(Self::new(UnixStream::connect(path).await?))
        }
    }

    impl Transport for UnixTransport {
        async fn recv(&self) -> Result<Bytes, TransportError> {
            loop {
                if self.is_closed() {
                    return Err(TransportError::Closed);
                }
                tokio::select! {
                    _ = self.inner.close_signal.notified() => return Err(TransportError::Closed),
                    ready = self.inner.stream.readable() => ready?,
                }
                let mut buf = vec![0u8; MAX_RECV];
                match self.inner.stream.try_read(&mut buf) {
                    Ok(0) => return Ok(Bytes::new()),
                    Ok(n) => {
                        buf.truncate(n);
                        return Ok(Bytes::from(buf));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        fn try_send(&self, data: &[u8]) -> Result<usize, TransportError> {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            match self.inner.stream.try_write(data) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(e.into()),
            }
        }

        async fn send_ready(&self) -> Result<(), TransportError> {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            tokio::select! {
                _ = self.inner.close_signal.notified() => Err(TransportError::Closed),
                ready = self.inner.stream.writable() => Ok(ready?),
            }
        }

        fn close(&self) {
            if !self.inner.closed.swap(true, Ordering::AcqRel) {
                self.inner.close_signal.notify_waiters();
            }
        }

        fn is_closed(&self) -> bool {
            self.inner.closed.load(Ordering::Acquire)
        }
    }

    /// [`Listener`] adapter over a bound [`UnixListener`].
    ///
    /// The socket file is not unlinked on close; callers own the path.
    pub struct UnixListenerAdapter {
        listener: UnixListener,
        closed: AtomicBool,
        close_signal: Notify,
    }

    impl UnixListenerAdapter {
        pub fn new(listener: UnixListener) -> Self {
            Self {
                listener,
                closed: AtomicBool::new(false),
                close_signal: Notify::new(),
            }
        }

        /// Bind the socket at `path` and wrap the listener.
        pub fn bind(path: impl AsRef<std::path::Path>) -> Result<Self, TransportError> {
            Ok(Self::new(UnixListener::bind(path)?))
        }
    }

    impl Listener for UnixListenerAdapter {
        fn accept(
            &self,
        ) -> Pin<
            Box<dyn Future<Output = Result<(AnyTransport, String), TransportError>> + Send + '_>,
        > {
            Box::pin(async move {
                if self.closed.load(Ordering::Acquire) {
                    return Err(TransportError::Closed);
                }
                let (stream, peer) = tokio::select! {
                    _ = self.close_signal.notified() => return Err(TransportError::Closed),
                    accepted = self.listener.accept() => accepted?,
                };
                let peer = peer
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unnamed".to_string());
                Ok((AnyTransport::new(UnixTransport::new(stream)), peer))
            })
        }

        fn local_addr(&self) -> Option<String> {
            self.listener
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
        }

        fn close(&self) {
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.close_signal.notify_waiters();
            }
        }
    }
}
