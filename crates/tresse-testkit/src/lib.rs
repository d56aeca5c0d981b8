//! tresse-testkit: Shared test services and helpers for tresse.
//!
//! Provides an echo service covering all four call shapes, stub
//! constructors for the client side, and connected-pair helpers over the
//! in-process transport. Integration tests across the workspace build on
//! these so scenarios stay consistent between transports.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use tresse::{
    CallError, CallKind, Connection, ConnectionConfig, Method, MethodStub, Role, Router,
};
use tresse_core::AnyTransport;
use tresse_transport_mem::MemTransport;

pub const UNARY: &str = "echo.Echo.Unary";
pub const SPREAD: &str = "echo.Echo.Spread";
pub const GATHER: &str = "echo.Echo.Gather";
pub const DUPLEX: &str = "echo.Echo.Duplex";
pub const FAIL: &str = "echo.Echo.Fail";
pub const NOTIFY: &str = "echo.Echo.Notify";

/// Application error code used by the failing echo method.
pub const ECHO_FAIL_CODE: u32 = 10_418;

fn register_codes() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        tresse::ErrorRegistry::register(ECHO_FAIL_CODE, "EchoFail");
    });
}

/// Echo service over all four call shapes, plus a failing method and a
/// void-response notification.
#[derive(Clone, Default)]
pub struct EchoService {
    /// Notifications received via [`NOTIFY`].
    pub notifications: Arc<AtomicUsize>,
}

impl EchoService {
    pub fn new() -> Self {
        register_codes();
        Self::default()
    }

    /// Build the service router.
    pub fn router(&self) -> Router {
        let notifications = self.notifications.clone();
        Router::builder()
            // Unary-unary: echo the single request back.
            .route(Method::new(UNARY, CallKind::UnaryUnary, |ctx| async move {
                let request = ctx.recv_message().await?.unwrap_or_default();
                ctx.send_message(request, false).await?;
                Ok(())
            }))
            // Unary-stream: the request is a decimal count; respond with
            // that many numbered messages.
            .route(Method::new(SPREAD, CallKind::UnaryStream, |ctx| async move {
                let request = ctx.recv_message().await?.unwrap_or_default();
                let count: u32 = std::str::from_utf8(&request)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| CallError::new(ECHO_FAIL_CODE, "request is not a count"))?;
                for i in 0..count {
                    ctx.send_message(Bytes::from(format!("{i}")), i + 1 == count)
                        .await?;
                }
                Ok(())
            }))
            // Stream-unary: concatenate every request message.
            .route(Method::new(GATHER, CallKind::StreamUnary, |ctx| async move {
                let mut all = BytesMut::new();
                while let Some(message) = ctx.recv_message().await? {
                    all.extend_from_slice(&message);
                }
                ctx.send_message(all.freeze(), false).await?;
                Ok(())
            }))
            // Stream-stream: echo each request message in order.
            .route(Method::new(DUPLEX, CallKind::StreamStream, |ctx| async move {
                while let Some(message) = ctx.recv_message().await? {
                    ctx.send_message(message, false).await?;
                }
                Ok(())
            }))
            .route(Method::new(FAIL, CallKind::UnaryUnary, |ctx| async move {
                let _ = ctx.recv_message().await?;
                Err(CallError::new(ECHO_FAIL_CODE, "echo failure").into())
            }))
            .route(
                Method::new(NOTIFY, CallKind::UnaryUnary, move |ctx| {
                    let notifications = notifications.clone();
                    async move {
                        let _ = ctx.recv_message().await?;
                        notifications.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .without_response(),
            )
            .build()
    }
}

pub fn unary_stub() -> MethodStub {
    MethodStub::unary_unary(UNARY)
}

pub fn spread_stub() -> MethodStub {
    MethodStub::unary_stream(SPREAD)
}

pub fn gather_stub() -> MethodStub {
    MethodStub::stream_unary(GATHER)
}

pub fn duplex_stub() -> MethodStub {
    MethodStub::stream_stream(DUPLEX)
}

pub fn fail_stub() -> MethodStub {
    MethodStub::unary_unary(FAIL)
}

pub fn notify_stub() -> MethodStub {
    MethodStub::unary_unary(NOTIFY).without_response()
}

/// A connected (client, server) pair over the in-process transport.
///
/// The server side runs `router`; the client side routes nothing.
pub fn mem_pair(router: Router, config: ConnectionConfig) -> (Connection, Connection) {
    pair_with_routers(Router::empty(), router, config)
}

/// A connected pair where both endpoints serve methods, for full-duplex
/// symmetric scenarios.
pub fn pair_with_routers(
    client_router: Router,
    server_router: Router,
    config: ConnectionConfig,
) -> (Connection, Connection) {
    let (a, b) = MemTransport::pair();
    let client = Connection::establish(
        "client-1",
        AnyTransport::new(a),
        Role::Initiator,
        Arc::new(client_router),
        config.clone(),
    );
    let server = Connection::establish(
        "server-1",
        AnyTransport::new(b),
        Role::Acceptor,
        Arc::new(server_router),
        config,
    );
    (client, server)
}

/// Install a test-friendly tracing subscriber, once. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
