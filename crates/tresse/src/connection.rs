//! One transport, one protocol, one context registry, one dispatch policy.
//!
//! The reader task is the only consumer of `transport.recv()`; it
//! accumulates bytes, runs the framing protocol over them and routes each
//! decoded frame into its context, synchronously, so per-context frame
//! order is preserved before any handler task gets to run.
//!
//! The write side keeps a single buffer per connection: `write` pushes
//! bytes straight into the transport while it has room and queues only the
//! remainder for a flusher task. `wait_write_all` is the backpressure hook
//! for producers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tresse_core::{
    AnyTransport, ErrorMessage, Meta, PacketFlags, PacketType, Protocol, TransportError,
};

use crate::config::ConnectionConfig;
use crate::context::OutboundContext;
use crate::error::{CallError, RpcError};
use crate::handler::Handler;
use crate::manager::{ContextManager, Role};
use crate::method::MethodDesc;
use crate::router::Router;

/// Close callback, fired once after the last context is cancelled.
pub type ConnCloseCallback = Box<dyn FnOnce(&Connection, Option<&RpcError>) + Send>;

struct WriteState {
    buffer: BytesMut,
    flusher_active: bool,
}

enum FlushStep {
    Drained,
    WouldBlock,
    Failed(TransportError),
}

pub(crate) struct ConnectionInner {
    id: String,
    role: Role,
    transport: AnyTransport,
    protocol: Protocol,
    manager: ContextManager,
    handler: Handler,
    router: Arc<Router>,
    config: ConnectionConfig,
    /// Touched only by the reader task.
    read_buf: Mutex<BytesMut>,
    write: Mutex<WriteState>,
    write_empty: Notify,
    is_closing: AtomicBool,
    is_closed: AtomicBool,
    finalized: AtomicBool,
    close_reason: Mutex<Option<RpcError>>,
    on_close: Mutex<Vec<ConnCloseCallback>>,
}

/// A full-duplex symmetric connection: either side may initiate calls,
/// distinguished only by transmission-id parity.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wire up a connection over an established transport and spawn its
    /// reader and dispatch tasks.
    pub fn establish(
        id: impl Into<String>,
        transport: AnyTransport,
        role: Role,
        router: Arc<Router>,
        config: ConnectionConfig,
    ) -> Self {
        let protocol = Protocol::with_max_packet(config.codec.clone(), config.max_packet);
        let handler = Handler::new(config.dispatch);
        let inner = Arc::new(ConnectionInner {
            id: id.into(),
            role,
            transport,
            protocol,
            manager: ContextManager::new(role),
            handler,
            router,
            config,
            read_buf: Mutex::new(BytesMut::new()),
            write: Mutex::new(WriteState {
                buffer: BytesMut::new(),
                flusher_active: false,
            }),
            write_empty: Notify::new(),
            is_closing: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            on_close: Mutex::new(Vec::new()),
        });
        let conn = Self { inner };

        conn.inner.handler.attach(conn.handle());
        let handler = conn.inner.handler.clone();
        let run = tokio::spawn(async move { handler.run().await });
        conn.inner.handler.set_run_task(run.abort_handle());

        let reader = conn.clone();
        tokio::spawn(async move { reader.read_loop().await });

        tracing::debug!(id = %conn.inner.id, role = ?role, "connection established");
        conn
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn manager(&self) -> &ContextManager {
        &self.inner.manager
    }

    pub fn handler(&self) -> &Handler {
        &self.inner.handler
    }

    pub fn is_closing(&self) -> bool {
        self.inner.is_closing.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<RpcError> {
        self.inner.close_reason.lock().clone()
    }

    /// Register a callback fired once the connection has fully closed.
    pub fn on_close(&self, callback: ConnCloseCallback) {
        self.inner.on_close.lock().push(callback);
    }

    pub(crate) fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Open an outbound context for one call.
    ///
    /// Refused once the connection is draining: shutdown stops new
    /// outbound work.
    pub fn open_context(
        &self,
        method: MethodDesc,
        timeout: Option<Duration>,
    ) -> Result<OutboundContext, RpcError> {
        if self.is_closing() || self.is_closed() {
            return Err(RpcError::Shutdown);
        }
        let timeout = timeout.or(self.inner.config.call_timeout);
        self.inner
            .manager
            .new_outbound(self.handle(), method, timeout)
    }

    /// Whether to keep the connection open for write-only use after the
    /// peer half-closes.
    pub fn eof_received(&self) -> bool {
        self.inner.config.keep_open_on_eof
    }

    async fn read_loop(self) {
        loop {
            if self.is_closed() {
                return;
            }
            match self.inner.transport.recv().await {
                Ok(chunk) if chunk.is_empty() => {
                    if self.eof_received() {
                        tracing::debug!(id = %self.inner.id, "EOF, keeping write side open");
                    } else {
                        self.close(None).await;
                    }
                    return;
                }
                Ok(chunk) => {
                    if let Err(e) = self.data_received(chunk).await {
                        tracing::error!(id = %self.inner.id, error = %e, "fatal receive error");
                        self.close(Some(e)).await;
                        return;
                    }
                }
                Err(TransportError::Closed) => {
                    self.close(None).await;
                    return;
                }
                Err(e) => {
                    self.close(Some(RpcError::Transport(e))).await;
                    return;
                }
            }
        }
    }

    /// Accumulate received bytes and route every fully available frame.
    pub(crate) async fn data_received(&self, chunk: Bytes) -> Result<(), RpcError> {
        let frames = {
            let mut buf = self.inner.read_buf.lock();
            buf.extend_from_slice(&chunk);
            self.inner.protocol.feed(&mut buf)?
        };
        for (meta, payload) in frames {
            self.route_frame(meta, payload).await?;
        }
        Ok(())
    }

    async fn route_frame(&self, meta: Meta, payload: Bytes) -> Result<(), RpcError> {
        tracing::trace!(
            id = %self.inner.id,
            transmission_id = meta.transmission_id,
            packet_type = ?meta.packet_type,
            flags = ?meta.packet_flags,
            payload_len = payload.len(),
            "frame received"
        );
        if let Some(ctx) = self.inner.manager.get(meta.transmission_id) {
            return ctx.feed_message(&meta, payload);
        }
        match meta.packet_type {
            // An abort for a call already gone on both sides.
            PacketType::Request if meta.is_cancelled() => {
                tracing::trace!(
                    id = %self.inner.id,
                    transmission_id = meta.transmission_id,
                    "cancel frame for unknown context, discarding"
                );
                Ok(())
            }
            PacketType::Request => self.accept_request(meta, payload).await,
            PacketType::Response => {
                // Should not occur under protocol discipline; a response for
                // a released context can still race a local cancel.
                tracing::warn!(
                    id = %self.inner.id,
                    transmission_id = meta.transmission_id,
                    "response frame for unknown context, discarding"
                );
                Ok(())
            }
        }
    }

    async fn accept_request(&self, meta: Meta, payload: Bytes) -> Result<(), RpcError> {
        let Some(method) = self.inner.router.get(&meta.service_method).cloned() else {
            tracing::warn!(
                id = %self.inner.id,
                method = %meta.service_method,
                "unknown service method"
            );
            let response = Meta::response(meta.transmission_id)
                .with_flags(PacketFlags::END_STREAM)
                .failed();
            let wire = CallError::not_found(&meta.service_method).to_wire();
            let _ = self.send_error_frame(response, wire).await;
            return Ok(());
        };

        let ctx = self.inner.manager.new_inbound(
            self.handle(),
            meta.transmission_id,
            method.desc().clone(),
            self.inner.config.call_timeout,
        )?;
        ctx.feed_message(&meta, payload)?;
        self.inner.handler.submit(ctx.run(method.implementation()));
        Ok(())
    }

    /// Encode and send one frame, pausing while the write buffer drains.
    pub async fn send_frame(&self, meta: Meta, payload: Bytes) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(self.close_reason().unwrap_or(RpcError::ConnectionClosed));
        }
        let frame = self.inner.protocol.encode(&meta, &payload)?;
        self.write(frame).await
    }

    pub(crate) async fn send_error_frame(
        &self,
        meta: Meta,
        wire: ErrorMessage,
    ) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(self.close_reason().unwrap_or(RpcError::ConnectionClosed));
        }
        let frame = self.inner.protocol.encode_error(&meta, &wire)?;
        self.write(frame).await
    }

    /// Queue bytes for sending.
    ///
    /// Tries a direct send first; only the part the transport would not
    /// take immediately goes through the buffer and its flusher task. When
    /// anything was buffered, the call suspends until the buffer drains, so
    /// producers feel the backpressure.
    pub async fn write(&self, data: Bytes) -> Result<(), RpcError> {
        let buffered = {
            let mut w = self.inner.write.lock();
            if w.buffer.is_empty() {
                let mut offset = 0;
                while offset < data.len() {
                    match self.inner.transport.try_send(&data[offset..]) {
                        Ok(0) => break,
                        Ok(n) => offset += n,
                        Err(e) => return Err(RpcError::Transport(e)),
                    }
                }
                if offset < data.len() {
                    w.buffer.extend_from_slice(&data[offset..]);
                }
            } else {
                w.buffer.extend_from_slice(&data);
            }
            if !w.buffer.is_empty() && !w.flusher_active {
                w.flusher_active = true;
                let conn = self.clone();
                tokio::spawn(async move { conn.flush_loop().await });
            }
            !w.buffer.is_empty()
        };
        if buffered {
            self.wait_write_all(None).await?;
        }
        Ok(())
    }

    async fn flush_loop(self) {
        loop {
            if let Err(e) = self.inner.transport.send_ready().await {
                self.fail_writes(e).await;
                return;
            }
            let step = {
                let mut w = self.inner.write.lock();
                let mut step = FlushStep::WouldBlock;
                while !w.buffer.is_empty() {
                    match self.inner.transport.try_send(&w.buffer[..]) {
                        Ok(0) => break,
                        Ok(n) => w.buffer.advance(n),
                        Err(e) => {
                            step = FlushStep::Failed(e);
                            break;
                        }
                    }
                }
                if matches!(step, FlushStep::WouldBlock) && w.buffer.is_empty() {
                    w.flusher_active = false;
                    step = FlushStep::Drained;
                }
                step
            };
            match step {
                FlushStep::Drained => {
                    self.inner.write_empty.notify_waiters();
                    return;
                }
                FlushStep::WouldBlock => continue,
                FlushStep::Failed(e) => {
                    self.fail_writes(e).await;
                    return;
                }
            }
        }
    }

    // Returns a boxed (type-erased) future so the flusher/close recursion
    // (`flush_loop` → `fail_writes` → `close` → … → `write`, which spawns
    // `flush_loop`) bottoms out and the spawned `flush_loop` future stays
    // `Send` — same pattern as `ConnectionHandle::close`.
    fn fail_writes(&self, error: TransportError) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let pending = {
                let mut w = self.inner.write.lock();
                w.flusher_active = false;
                let n = w.buffer.len();
                w.buffer.clear();
                n
            };
            self.inner.write_empty.notify_waiters();
            if pending > 0 {
                tracing::debug!(
                    id = %self.inner.id,
                    pending,
                    error = %error,
                    "write buffer dropped, transport failed"
                );
            }
            self.close(Some(RpcError::Transport(error))).await;
        })
    }

    /// Resolve once the write buffer is empty.
    ///
    /// With a timeout, gives backpressure-aware producers a bounded pause.
    pub async fn wait_write_all(&self, timeout: Option<Duration>) -> Result<(), RpcError> {
        match timeout {
            None => self.wait_write_all_inner().await,
            Some(t) => tokio::time::timeout(t, self.wait_write_all_inner())
                .await
                .map_err(|_| RpcError::Timeout)?,
        }
    }

    async fn wait_write_all_inner(&self) -> Result<(), RpcError> {
        loop {
            let mut notified = std::pin::pin!(self.inner.write_empty.notified());
            notified.as_mut().enable();
            if self.inner.write.lock().buffer.is_empty() {
                return Ok(());
            }
            if self.is_closed() {
                return Err(self.close_reason().unwrap_or(RpcError::ConnectionClosed));
            }
            notified.await;
        }
    }

    /// Stop accepting new outbound work and signal the handler to drain.
    /// The handler closes the connection after processing everything
    /// already queued.
    pub fn shutdown(&self) {
        if self.inner.is_closing.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(id = %self.inner.id, "connection draining");
        self.inner.handler.shutdown();
    }

    /// Tear down the transport and release every outstanding context with
    /// `reason`. Idempotent. A graceful close (no reason) first lets
    /// buffered writes drain.
    pub async fn close(&self, reason: Option<RpcError>) {
        if self.inner.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.is_closing.store(true, Ordering::Release);
        if let Some(reason) = reason {
            let mut slot = self.inner.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        let reason = self.close_reason();
        tracing::debug!(
            id = %self.inner.id,
            reason = reason.as_ref().map(tracing::field::display),
            "connection closing"
        );

        if reason.is_none() {
            self.drain_writes().await;
        }
        self.inner.transport.close();
        self.inner.write_empty.notify_waiters();
        self.inner.handler.close(reason).await;
        self.final_close().await;
    }

    async fn drain_writes(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.write_empty.notified());
            notified.as_mut().enable();
            {
                let w = self.inner.write.lock();
                if w.buffer.is_empty() || !w.flusher_active {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Runs once, after transport and handler teardown: cancels every
    /// remaining context with the close reason and fires close callbacks.
    async fn final_close(&self) {
        if self.inner.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = self.close_reason();
        self.inner
            .manager
            .cancel_all(reason.clone().unwrap_or(RpcError::ConnectionClosed))
            .await;
        let callbacks: Vec<ConnCloseCallback> = std::mem::take(&mut *self.inner.on_close.lock());
        for callback in callbacks {
            callback(self, reason.as_ref());
        }
        tracing::debug!(id = %self.inner.id, "connection closed");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("contexts", &self.inner.manager.len())
            .field("is_closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Non-owning handle held by contexts and the handler.
///
/// Contexts never keep the connection alive; release flows through the
/// manager explicitly, and a dead handle just reports the connection as
/// closed.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: std::sync::Weak<ConnectionInner>,
}

impl ConnectionHandle {
    pub(crate) fn dangling() -> Self {
        Self {
            inner: std::sync::Weak::new(),
        }
    }

    fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }

    pub(crate) async fn send_frame(&self, meta: Meta, payload: Bytes) -> Result<(), RpcError> {
        match self.upgrade() {
            Some(conn) => conn.send_frame(meta, payload).await,
            None => Err(RpcError::ConnectionClosed),
        }
    }

    pub(crate) async fn send_error_frame(
        &self,
        meta: Meta,
        wire: ErrorMessage,
    ) -> Result<(), RpcError> {
        match self.upgrade() {
            Some(conn) => conn.send_error_frame(meta, wire).await,
            None => Err(RpcError::ConnectionClosed),
        }
    }

    pub(crate) fn decode_error(&self, payload: &[u8]) -> Result<ErrorMessage, RpcError> {
        let conn = self.upgrade().ok_or(RpcError::ConnectionClosed)?;
        let wire = conn.inner.protocol.codec().decode_error(payload)?;
        Ok(wire)
    }

    pub(crate) fn release_context(&self, transmission_id: u32) {
        if let Some(conn) = self.upgrade() {
            conn.inner.manager.release(transmission_id);
        }
    }

    /// Boxed so the handler/connection close recursion bottoms out.
    pub(crate) fn close(&self, reason: Option<RpcError>) -> BoxFuture<'static, ()> {
        let conn = self.upgrade();
        Box::pin(async move {
            if let Some(conn) = conn {
                conn.close(reason).await;
            }
        })
    }
}
