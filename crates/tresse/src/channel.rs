//! Connection acceptance and channel lifecycle.
//!
//! A channel owns the listener set and the live connections. Its lifecycle
//! is a totally ordered state machine, so "already past this point" checks
//! are plain comparisons. Acceptance is admission-controlled: once the
//! connection set reaches the configured ceiling the channel pauses and
//! resumes automatically when a connection closes frees capacity.
//!
//! Closing is staged. `shutdown` stops accepting and asks live connections
//! to drain; `close` tears listeners and connections down, finalizing
//! immediately when the set is empty and otherwise when the last connection
//! reports closed.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tresse_core::{AnyTransport, Listener};

use crate::config::ChannelConfig;
use crate::connection::Connection;
use crate::error::{CallError, RpcError};
use crate::manager::Role;
use crate::middleware::MiddlewareManager;
use crate::router::Router;

/// Channel lifecycle states, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelState {
    Created,
    Started,
    /// Accepting is suspended; resumes when capacity frees up.
    Paused,
    /// Draining: no new connections, live ones finish their work.
    ShuttingDown,
    /// Listeners are gone; waiting for the last connection to close.
    Closing,
    Closed,
}

struct ChannelInner {
    name: String,
    config: ChannelConfig,
    router: Arc<Router>,
    middleware: MiddlewareManager,
    state: Mutex<ChannelState>,
    /// Every registered listener, kept for close.
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    /// Listeners registered before `start`, waiting for their accept loop.
    pending_listeners: Mutex<Vec<Arc<dyn Listener>>>,
    connections: Mutex<HashMap<String, Connection>>,
    next_conn_id: AtomicU64,
    /// Signalled when a connection closes or the lifecycle advances, waking
    /// paused accept loops.
    capacity_freed: Notify,
    closed_tx: watch::Sender<bool>,
}

/// Accepts and dials connections, owns the live connection set.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn new(name: impl Into<String>, router: Router, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                config,
                router: Arc::new(router),
                middleware: MiddlewareManager::new(),
                state: Mutex::new(ChannelState::Created),
                listeners: Mutex::new(Vec::new()),
                pending_listeners: Mutex::new(Vec::new()),
                connections: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(0),
                capacity_freed: Notify::new(),
                closed_tx: watch::Sender::new(false),
            }),
        }
    }

    /// Replace the middleware set. Only callable before `start`.
    pub fn with_middleware(self, middleware: MiddlewareManager) -> Self {
        assert_eq!(
            self.state(),
            ChannelState::Created,
            "middleware must be installed before start"
        );
        // Sole other reference is inside `self`; no clones exist yet.
        let mut inner = self.inner;
        Arc::get_mut(&mut inner)
            .expect("channel not yet shared")
            .middleware = middleware;
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    pub fn len(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The admission-control invariant.
    pub fn is_full(&self) -> bool {
        self.len() >= self.inner.config.max_connections
    }

    /// Register a listening socket.
    ///
    /// Listeners added after `start` begin accepting immediately.
    pub fn listen(&self, listener: impl Listener) {
        let listener: Arc<dyn Listener> = Arc::new(listener);
        self.inner.listeners.lock().push(listener.clone());
        let state = self.state();
        if state >= ChannelState::Started && state < ChannelState::ShuttingDown {
            self.spawn_accept_loop(listener);
        } else {
            self.inner.pending_listeners.lock().push(listener);
        }
    }

    /// Begin accepting on every registered listener.
    pub fn start(&self) -> Result<(), RpcError> {
        {
            let mut state = self.inner.state.lock();
            if *state >= ChannelState::ShuttingDown {
                return Err(RpcError::Shutdown);
            }
            if *state >= ChannelState::Started {
                return Ok(());
            }
            *state = ChannelState::Started;
        }
        tracing::info!(name = %self.inner.name, "channel started");
        self.inner.middleware.start(self);
        let pending: Vec<_> = self.inner.pending_listeners.lock().drain(..).collect();
        for listener in pending {
            self.spawn_accept_loop(listener);
        }
        Ok(())
    }

    fn spawn_accept_loop(&self, listener: Arc<dyn Listener>) {
        let channel = self.clone();
        tokio::spawn(async move { channel.accept_loop(listener).await });
    }

    /// One accept loop per listener.
    ///
    /// Reads up to `max_accept` pending connections per wake-up, stopping
    /// early when the channel fills up; a full channel pauses until a close
    /// frees capacity.
    async fn accept_loop(self, listener: Arc<dyn Listener>) {
        let addr = listener.local_addr();
        tracing::debug!(
            name = %self.inner.name,
            addr = addr.as_deref().unwrap_or("?"),
            "accept loop running"
        );
        loop {
            if self.state() >= ChannelState::ShuttingDown {
                return;
            }
            if self.is_full() {
                if !self.pause_until_capacity().await {
                    return;
                }
                continue;
            }
            match listener.accept().await {
                Ok((transport, peer)) => self.admit(transport, &peer),
                Err(e) => {
                    tracing::debug!(name = %self.inner.name, error = %e, "accept loop stopping");
                    return;
                }
            }
            // Drain whatever else is already pending without yielding back
            // to the scheduler.
            for _ in 1..self.inner.config.max_accept {
                if self.is_full() || self.state() >= ChannelState::ShuttingDown {
                    break;
                }
                match listener.accept().now_or_never() {
                    None => break,
                    Some(Ok((transport, peer))) => self.admit(transport, &peer),
                    Some(Err(_)) => break,
                }
            }
        }
    }

    fn admit(&self, transport: AnyTransport, peer: &str) {
        match self.connection_made(transport.clone()) {
            Ok(conn) => {
                tracing::debug!(name = %self.inner.name, id = %conn.id(), peer, "accepted");
            }
            Err(e) => {
                tracing::warn!(name = %self.inner.name, peer, error = %e, "connection refused");
                transport.close();
            }
        }
    }

    /// Pause accepting until capacity frees up.
    ///
    /// Returns `false` when the channel began shutting down instead.
    async fn pause_until_capacity(&self) -> bool {
        let paused = {
            let mut state = self.inner.state.lock();
            if *state == ChannelState::Started {
                *state = ChannelState::Paused;
                true
            } else {
                false
            }
        };
        if paused {
            tracing::info!(name = %self.inner.name, connections = self.len(), "channel full, pausing accept");
            self.inner.middleware.pause(self);
        }
        loop {
            let mut freed = pin!(self.inner.capacity_freed.notified());
            freed.as_mut().enable();
            if self.state() >= ChannelState::ShuttingDown {
                return false;
            }
            if !self.is_full() {
                break;
            }
            freed.await;
        }
        let resumed = {
            let mut state = self.inner.state.lock();
            if *state == ChannelState::Paused {
                *state = ChannelState::Started;
                true
            } else {
                false
            }
        };
        if resumed {
            tracing::info!(name = %self.inner.name, "capacity freed, resuming accept");
            self.inner.middleware.start(self);
        }
        true
    }

    /// Admit one accepted transport as a connection.
    ///
    /// Refused while paused, full or shutting down; the refusal reason tells
    /// the caller which.
    pub fn connection_made(&self, transport: AnyTransport) -> Result<Connection, RpcError> {
        self.register(transport, Role::Acceptor)
    }

    /// Dial-side counterpart: wrap an established transport as an
    /// initiating connection. Subject to the same admission control.
    pub fn connect(&self, transport: AnyTransport) -> Result<Connection, RpcError> {
        self.register(transport, Role::Initiator)
    }

    fn register(&self, transport: AnyTransport, role: Role) -> Result<Connection, RpcError> {
        let state = self.state();
        if state >= ChannelState::ShuttingDown {
            return Err(RpcError::Shutdown);
        }
        if state == ChannelState::Paused {
            return Err(CallError::server_paused().into());
        }
        if self.is_full() {
            return Err(CallError::connection_limit().into());
        }

        let n = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}-{n}", self.inner.name);
        let conn = Connection::establish(
            id.clone(),
            transport,
            role,
            self.inner.router.clone(),
            self.inner.config.connection.clone(),
        );

        let weak = Arc::downgrade(&self.inner);
        conn.on_close(Box::new(move |conn, _reason| {
            if let Some(inner) = weak.upgrade() {
                (Channel { inner }).connection_lost(conn);
            }
        }));

        self.inner.connections.lock().insert(id, conn.clone());
        self.inner.middleware.connection_made(self, &conn);
        Ok(conn)
    }

    fn connection_lost(&self, conn: &Connection) {
        let removed = self.inner.connections.lock().remove(conn.id());
        if removed.is_none() {
            return;
        }
        tracing::debug!(name = %self.inner.name, id = %conn.id(), "connection lost");
        self.inner.middleware.connection_lost(self, conn);
        self.inner.capacity_freed.notify_waiters();
        if self.state() >= ChannelState::Closing && self.is_empty() {
            self.finalize();
        }
    }

    /// Stop accepting and tell live connections to drain.
    ///
    /// Connections finish the work already queued on their handlers, then
    /// close themselves.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state >= ChannelState::ShuttingDown {
                return;
            }
            *state = ChannelState::ShuttingDown;
        }
        tracing::info!(name = %self.inner.name, connections = self.len(), "channel shutting down");
        self.inner.capacity_freed.notify_waiters();
        self.inner.middleware.shutdown(self);
        let connections: Vec<Connection> = self.inner.connections.lock().values().cloned().collect();
        for conn in connections {
            conn.shutdown();
        }
    }

    /// Close listeners and remaining connections.
    ///
    /// Finalizes to `Closed` immediately when no connections remain;
    /// otherwise finalization happens when the last one reports closed.
    /// `join` awaits it either way.
    pub async fn close(&self, reason: Option<RpcError>) {
        self.shutdown();
        {
            let mut state = self.inner.state.lock();
            if *state >= ChannelState::Closing {
                return;
            }
            *state = ChannelState::Closing;
        }
        tracing::info!(
            name = %self.inner.name,
            reason = reason.as_ref().map(tracing::field::display),
            "channel closing"
        );

        let listeners: Vec<_> = self.inner.listeners.lock().drain(..).collect();
        for listener in listeners {
            listener.close();
        }
        self.inner.pending_listeners.lock().clear();

        let connections: Vec<Connection> = self.inner.connections.lock().values().cloned().collect();
        for conn in connections {
            conn.close(reason.clone()).await;
        }
        if self.is_empty() {
            self.finalize();
        }
    }

    fn finalize(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        tracing::info!(name = %self.inner.name, "channel closed");
        self.inner.middleware.close(self);
        let _ = self.inner.closed_tx.send_replace(true);
    }

    /// Await full closure, including deferred finalization.
    pub async fn join(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("connections", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::middleware::Middleware;

    fn test_channel(max_connections: usize) -> Channel {
        let config = ChannelConfig {
            max_connections,
            ..ChannelConfig::default()
        };
        Channel::new("test", Router::empty(), config)
    }

    fn mem_transport_pair() -> (AnyTransport, AnyTransport) {
        // A self-contained stand-in so unit tests need no transport crate.
        use bytes::Bytes;
        use std::sync::atomic::AtomicBool;
        use tokio::sync::{Mutex as AsyncMutex, mpsc};
        use tresse_core::{Transport, TransportError};

        #[derive(Clone)]
        struct Pipe {
            tx: mpsc::UnboundedSender<Bytes>,
            rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Bytes>>>,
            closed: Arc<AtomicBool>,
        }

        impl Transport for Pipe {
            async fn recv(&self) -> Result<Bytes, TransportError> {
                if self.closed.load(Ordering::Acquire) {
                    return Err(TransportError::Closed);
                }
                let chunk = self.rx.lock().await.recv().await;
                Ok(chunk.unwrap_or_default())
            }

            fn try_send(&self, data: &[u8]) -> Result<usize, TransportError> {
                if self.closed.load(Ordering::Acquire) {
                    return Err(TransportError::Closed);
                }
                self.tx
                    .send(Bytes::copy_from_slice(data))
                    .map(|_| data.len())
                    .map_err(|_| TransportError::Closed)
            }

            async fn send_ready(&self) -> Result<(), TransportError> {
                Ok(())
            }

            fn close(&self) {
                if !self.closed.swap(true, Ordering::AcqRel) {
                    let _ = self.tx.send(Bytes::new());
                }
            }

            fn is_closed(&self) -> bool {
                self.closed.load(Ordering::Acquire)
            }
        }

        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = Pipe {
            tx: tx_b,
            rx: Arc::new(AsyncMutex::new(rx_a)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        let b = Pipe {
            tx: tx_a,
            rx: Arc::new(AsyncMutex::new(rx_b)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (AnyTransport::new(a), AnyTransport::new(b))
    }

    #[tokio::test]
    async fn states_are_ordered() {
        assert!(ChannelState::Created < ChannelState::Started);
        assert!(ChannelState::Started < ChannelState::Paused);
        assert!(ChannelState::Paused < ChannelState::ShuttingDown);
        assert!(ChannelState::ShuttingDown < ChannelState::Closing);
        assert!(ChannelState::Closing < ChannelState::Closed);
    }

    #[tokio::test]
    async fn admission_control_refuses_when_full() {
        let channel = test_channel(2);
        channel.start().unwrap();

        let (t1, _peer1) = mem_transport_pair();
        let (t2, _peer2) = mem_transport_pair();
        let (t3, _peer3) = mem_transport_pair();

        let c1 = channel.connection_made(t1).unwrap();
        let _c2 = channel.connection_made(t2).unwrap();
        assert!(channel.is_full());
        assert!(matches!(
            channel.connection_made(t3.clone()),
            Err(RpcError::Call(e)) if e.code == crate::error::code::CONNECTION_LIMIT
        ));

        // A close frees capacity.
        c1.close(None).await;
        assert!(!channel.is_full());
        assert!(channel.connection_made(t3).is_ok());
    }

    #[tokio::test]
    async fn close_with_no_connections_finalizes_immediately() {
        let channel = test_channel(8);
        channel.start().unwrap();
        channel.close(None).await;
        assert_eq!(channel.state(), ChannelState::Closed);
        channel.join().await;
    }

    #[tokio::test]
    async fn close_cascades_to_connections() {
        let channel = test_channel(8);
        channel.start().unwrap();

        let (t1, _peer) = mem_transport_pair();
        let conn = channel.connection_made(t1).unwrap();
        channel.close(None).await;

        channel.join().await;
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(conn.is_closed());
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn start_after_shutdown_is_refused() {
        let channel = test_channel(8);
        channel.start().unwrap();
        channel.shutdown();
        assert!(matches!(channel.start(), Err(RpcError::Shutdown)));
    }

    #[tokio::test]
    async fn middleware_sees_lifecycle_events() {
        #[derive(Default)]
        struct Counter {
            connects: AtomicUsize,
            losses: AtomicUsize,
            closes: AtomicUsize,
        }

        impl Middleware for Arc<Counter> {
            fn on_connection_made(&self, _channel: &Channel, _conn: &Connection) {
                self.connects.fetch_add(1, Ordering::SeqCst);
            }
            fn on_connection_lost(&self, _channel: &Channel, _conn: &Connection) {
                self.losses.fetch_add(1, Ordering::SeqCst);
            }
            fn on_close(&self, _channel: &Channel) {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(Counter::default());
        let channel = test_channel(8)
            .with_middleware(MiddlewareManager::new().with(Arc::new(counter.clone())));
        channel.start().unwrap();

        let (t1, _peer) = mem_transport_pair();
        let conn = channel.connection_made(t1).unwrap();
        conn.close(None).await;
        channel.close(None).await;
        channel.join().await;

        assert_eq!(counter.connects.load(Ordering::SeqCst), 1);
        assert_eq!(counter.losses.load(Ordering::SeqCst), 1);
        assert_eq!(counter.closes.load(Ordering::SeqCst), 1);
    }
}
