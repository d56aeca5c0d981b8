//! Method descriptors, server-side implementations and client-side stubs.
//!
//! The two streaming booleans collapse into a [`CallKind`] exactly once, at
//! registration time; call-time dispatch is a map read plus a match on the
//! tagged variant.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::context::{InboundContext, OutboundContext};
use crate::connection::Connection;
use crate::error::RpcError;

/// The four call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    UnaryUnary,
    UnaryStream,
    StreamUnary,
    StreamStream,
}

impl CallKind {
    /// Classify from the (client_streaming, server_streaming) pair.
    pub fn from_streaming(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => Self::UnaryUnary,
            (false, true) => Self::UnaryStream,
            (true, false) => Self::StreamUnary,
            (true, true) => Self::StreamStream,
        }
    }

    /// May the request side carry more than one message?
    pub fn client_streaming(self) -> bool {
        matches!(self, Self::StreamUnary | Self::StreamStream)
    }

    /// May the response side carry more than one message?
    pub fn server_streaming(self) -> bool {
        matches!(self, Self::UnaryStream | Self::StreamStream)
    }
}

/// Shape metadata shared by server methods and client stubs.
#[derive(Debug, Clone)]
pub struct MethodDesc {
    pub name: Arc<str>,
    pub kind: CallKind,
    /// `false` for notification-style methods with a void response: the
    /// server never sends a response frame and the client does not wait for
    /// one.
    pub requires_response: bool,
}

impl MethodDesc {
    pub fn new(name: impl Into<Arc<str>>, kind: CallKind) -> Self {
        Self {
            name: name.into(),
            kind,
            requires_response: true,
        }
    }
}

/// Boxed async method implementation.
///
/// The implementation drives the inbound context itself: it receives
/// requests and sends responses message by message, so all four call shapes
/// share one signature. A returned [`RpcError::Call`] becomes a structured
/// error response; any other error is fatal to the connection.
pub type MethodImpl =
    Arc<dyn Fn(InboundContext) -> Pin<Box<dyn Future<Output = Result<(), RpcError>> + Send>> + Send + Sync>;

/// A registered server-side method. Immutable after registration.
#[derive(Clone)]
pub struct Method {
    desc: MethodDesc,
    implementation: MethodImpl,
}

impl Method {
    pub fn new<F, Fut>(name: impl Into<Arc<str>>, kind: CallKind, implementation: F) -> Self
    where
        F: Fn(InboundContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        Self {
            desc: MethodDesc::new(name, kind),
            implementation: Arc::new(move |ctx| Box::pin(implementation(ctx))),
        }
    }

    /// Mark the response type as void: no response frame is ever sent.
    pub fn without_response(mut self) -> Self {
        self.desc.requires_response = false;
        self
    }

    pub fn desc(&self) -> &MethodDesc {
        &self.desc
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub(crate) fn implementation(&self) -> MethodImpl {
        self.implementation.clone()
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.desc.name)
            .field("kind", &self.desc.kind)
            .finish_non_exhaustive()
    }
}

/// Client-side method stub: same shape metadata, produces an outbound
/// context per invocation instead of running an implementation.
#[derive(Debug, Clone)]
pub struct MethodStub {
    desc: MethodDesc,
}

impl MethodStub {
    pub fn new(name: impl Into<Arc<str>>, kind: CallKind) -> Self {
        Self {
            desc: MethodDesc::new(name, kind),
        }
    }

    pub fn unary_unary(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, CallKind::UnaryUnary)
    }

    pub fn unary_stream(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, CallKind::UnaryStream)
    }

    pub fn stream_unary(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, CallKind::StreamUnary)
    }

    pub fn stream_stream(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, CallKind::StreamStream)
    }

    /// Mark the response type as void.
    pub fn without_response(mut self) -> Self {
        self.desc.requires_response = false;
        self
    }

    pub fn desc(&self) -> &MethodDesc {
        &self.desc
    }

    /// Open an outbound context for one invocation of this method.
    pub fn open(
        &self,
        conn: &Connection,
        timeout: Option<Duration>,
    ) -> Result<OutboundContext, RpcError> {
        conn.open_context(self.desc.clone(), timeout)
    }

    /// Unary-unary recipe: send one request, await exactly one response,
    /// close.
    pub async fn unary(&self, conn: &Connection, request: Bytes) -> Result<Bytes, RpcError> {
        let ctx = self.open(conn, None)?;
        let result = async {
            ctx.send_message(request, false).await?;
            Ok(ctx.recv_message().await?.unwrap_or_default())
        }
        .await;
        ctx.close(result.as_ref().err().cloned()).await;
        result
    }

    /// Unary-unary recipe with a per-call timeout.
    pub async fn unary_with_timeout(
        &self,
        conn: &Connection,
        request: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, RpcError> {
        let ctx = self.open(conn, Some(timeout))?;
        let result = async {
            ctx.send_message(request, false).await?;
            Ok(ctx.recv_message().await?.unwrap_or_default())
        }
        .await;
        ctx.close(result.as_ref().err().cloned()).await;
        result
    }

    /// Unary-stream recipe: send one request, return the context for the
    /// caller to iterate responses until the end marker, then close.
    pub async fn server_streaming(
        &self,
        conn: &Connection,
        request: Bytes,
    ) -> Result<OutboundContext, RpcError> {
        let ctx = self.open(conn, None)?;
        if let Err(e) = ctx.send_message(request, false).await {
            ctx.close(Some(e.clone())).await;
            return Err(e);
        }
        Ok(ctx)
    }

    /// Stream-unary recipe: send every request (marking the last as the end
    /// of the stream), await exactly one response, close.
    pub async fn client_streaming(
        &self,
        conn: &Connection,
        requests: Vec<Bytes>,
    ) -> Result<Bytes, RpcError> {
        let ctx = self.open(conn, None)?;
        let result = async {
            if requests.is_empty() {
                // An empty request stream still needs its end marker.
                ctx.send_message(Bytes::new(), true).await?;
            } else {
                let last = requests.len() - 1;
                for (i, request) in requests.into_iter().enumerate() {
                    ctx.send_message(request, i == last).await?;
                }
            }
            Ok(ctx.recv_message().await?.unwrap_or_default())
        }
        .await;
        ctx.close(result.as_ref().err().cloned()).await;
        result
    }

    /// Stream-stream recipe: the caller interleaves `send_message` (marking
    /// the last request with `end`) and `recv_message` until the end marker,
    /// then closes the returned context.
    pub fn duplex(&self, conn: &Connection) -> Result<OutboundContext, RpcError> {
        self.open(conn, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_kind_classification() {
        assert_eq!(CallKind::from_streaming(false, false), CallKind::UnaryUnary);
        assert_eq!(CallKind::from_streaming(false, true), CallKind::UnaryStream);
        assert_eq!(CallKind::from_streaming(true, false), CallKind::StreamUnary);
        assert_eq!(CallKind::from_streaming(true, true), CallKind::StreamStream);

        assert!(CallKind::StreamStream.client_streaming());
        assert!(CallKind::StreamStream.server_streaming());
        assert!(!CallKind::UnaryStream.client_streaming());
        assert!(CallKind::UnaryStream.server_streaming());
    }
}
