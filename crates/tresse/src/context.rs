//! Per-call state machines.
//!
//! A context is created when an inbound frame carries a previously-unseen
//! transmission id with a request packet type, or when an outbound call is
//! initiated; it is destroyed exactly once, on normal completion,
//! cancellation, timeout or connection loss.
//!
//! Message delivery between the connection's reader and the call logic goes
//! through an explicit queue with an end-of-stream sentinel. `feed_message`
//! pushes, `recv_message` pulls; at most one `recv_message` may be
//! suspended per context at a time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tresse_core::{Meta, PacketFlags, PacketType};

use crate::connection::ConnectionHandle;
use crate::error::{CallError, ContractViolation, RpcError};
use crate::method::{MethodDesc, MethodImpl};

/// Which endpoint created the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Created to handle a received request.
    Inbound,
    /// Created to issue an outgoing call.
    Outbound,
}

enum QueueItem {
    Data(Bytes),
    /// Logical end-of-stream marker.
    End,
    /// An error injected into the receive path.
    Fault(RpcError),
}

struct ContextState {
    queue: VecDeque<QueueItem>,
    /// Messages fed from the wire.
    fed: u32,
    /// Messages handed to the local consumer.
    received: u32,
    /// Messages sent to the wire.
    sent: u32,
    sent_end: bool,
    recv_waiting: bool,
    closed: bool,
    cancelled: bool,
    close_reason: Option<RpcError>,
    timer: Option<AbortHandle>,
}

pub(crate) struct ContextCore {
    conn: ConnectionHandle,
    transmission_id: u32,
    method: MethodDesc,
    direction: Direction,
    state: Mutex<ContextState>,
    wakeup: Notify,
}

impl ContextCore {
    fn new(
        conn: ConnectionHandle,
        transmission_id: u32,
        method: MethodDesc,
        direction: Direction,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn,
            transmission_id,
            method,
            direction,
            state: Mutex::new(ContextState {
                queue: VecDeque::new(),
                fed: 0,
                received: 0,
                sent: 0,
                sent_end: false,
                recv_waiting: false,
                closed: false,
                cancelled: false,
                close_reason: None,
                timer: None,
            }),
            wakeup: Notify::new(),
        })
    }

    /// Whether the wire-facing receive side of this context is a stream.
    fn recv_streaming(&self) -> bool {
        match self.direction {
            Direction::Inbound => self.method.kind.client_streaming(),
            Direction::Outbound => self.method.kind.server_streaming(),
        }
    }

    /// Whether the wire-facing send side of this context is a stream.
    fn send_streaming(&self) -> bool {
        match self.direction {
            Direction::Inbound => self.method.kind.server_streaming(),
            Direction::Outbound => self.method.kind.client_streaming(),
        }
    }

    /// Deliver a decoded frame from the connection's reader.
    ///
    /// Runs synchronously on the dispatch path, so per-context frame order
    /// is preserved before any handler task gets to run. Errors here mean a
    /// buggy peer and are fatal to the connection.
    fn feed_message(&self, meta: &Meta, payload: Bytes) -> Result<(), RpcError> {
        let expected = match self.direction {
            Direction::Inbound => PacketType::Request,
            Direction::Outbound => PacketType::Response,
        };
        if meta.packet_type != expected {
            return Err(ContractViolation::UnexpectedPacketType {
                transmission_id: self.transmission_id,
            }
            .into());
        }

        let mut s = self.state.lock();
        if s.closed {
            tracing::trace!(
                transmission_id = self.transmission_id,
                "frame for closed context, dropping"
            );
            return Ok(());
        }
        // Error and cancel frames are exempt from the unary multiplicity
        // check: an abort legitimately follows the single data message.
        let is_error = meta.is_failed || meta.is_cancelled();
        if s.fed > 0 && !self.recv_streaming() && !is_error {
            let violation = match self.direction {
                Direction::Inbound => ContractViolation::MultipleRequestForUnaryMethod {
                    method: self.method.name.to_string(),
                    transmission_id: self.transmission_id,
                },
                Direction::Outbound => ContractViolation::MultipleResponseForUnaryMethod {
                    method: self.method.name.to_string(),
                    transmission_id: self.transmission_id,
                },
            };
            return Err(violation.into());
        }
        s.fed += 1;

        if is_error {
            let wire = self.conn.decode_error(&payload)?;
            s.queue
                .push_back(QueueItem::Fault(RpcError::Call(CallError::from_wire(&wire))));
        } else if !payload.is_empty() {
            s.queue.push_back(QueueItem::Data(payload));
        }
        if meta.is_end_stream() {
            s.queue.push_back(QueueItem::End);
        }
        drop(s);

        self.wakeup.notify_one();
        Ok(())
    }

    /// Wait for the next message from the peer.
    ///
    /// `Ok(None)` is the logical end of the stream. At most one caller may
    /// be suspended here per context.
    async fn recv_message(&self) -> Result<Option<Bytes>, RpcError> {
        if self.direction == Direction::Outbound && !self.method.requires_response {
            return Ok(None);
        }
        loop {
            {
                let mut s = self.state.lock();
                if s.received > 0 && !self.recv_streaming() {
                    let violation = match self.direction {
                        Direction::Inbound => ContractViolation::RequestAlreadyReceived {
                            method: self.method.name.to_string(),
                            transmission_id: self.transmission_id,
                        },
                        Direction::Outbound => ContractViolation::ResponseAlreadyReceived {
                            method: self.method.name.to_string(),
                            transmission_id: self.transmission_id,
                        },
                    };
                    return Err(violation.into());
                }
                if let Some(item) = s.queue.pop_front() {
                    s.received += 1;
                    return match item {
                        QueueItem::Data(payload) => Ok(Some(payload)),
                        QueueItem::End => Ok(None),
                        QueueItem::Fault(e) => Err(e),
                    };
                }
                if s.closed {
                    return Err(s.close_reason.clone().unwrap_or(RpcError::ConnectionClosed));
                }
                if s.recv_waiting {
                    return Err(RpcError::RecvInProgress);
                }
                s.recv_waiting = true;
            }
            self.wakeup.notified().await;
            self.state.lock().recv_waiting = false;
        }
    }

    /// Send one message to the peer.
    ///
    /// The final message of a stream carries the end marker; unary sends
    /// always do.
    async fn send_message(&self, payload: Bytes, end: bool) -> Result<(), RpcError> {
        if self.direction == Direction::Inbound && !self.method.requires_response {
            return Ok(());
        }
        let meta = {
            let mut s = self.state.lock();
            if s.closed {
                return Err(s.close_reason.clone().unwrap_or(RpcError::ConnectionClosed));
            }
            let streaming = self.send_streaming();
            if s.sent > 0 && !streaming {
                let violation = match self.direction {
                    Direction::Inbound => ContractViolation::ResponseAlreadySent {
                        method: self.method.name.to_string(),
                        transmission_id: self.transmission_id,
                    },
                    Direction::Outbound => ContractViolation::RequestAlreadySent {
                        method: self.method.name.to_string(),
                        transmission_id: self.transmission_id,
                    },
                };
                return Err(violation.into());
            }
            let mut flags = PacketFlags::empty();
            if end || !streaming {
                flags |= PacketFlags::END_STREAM;
                s.sent_end = true;
            }
            s.sent += 1;
            match self.direction {
                Direction::Inbound => Meta::response(self.transmission_id).with_flags(flags),
                Direction::Outbound => {
                    Meta::request(self.transmission_id, self.method.name.as_ref()).with_flags(flags)
                }
            }
        };
        self.conn.send_frame(meta, payload).await
    }

    /// Close exactly once.
    ///
    /// A call-visible reason is announced to the peer: an error response on
    /// the inbound side (including timeouts, so the awaiting caller resolves
    /// instead of waiting out its own timer), a cancel frame on the outbound
    /// side for application errors only. A stream-sending side that never
    /// sent its end marker synthesizes one, so the peer's iteration
    /// terminates.
    async fn close(&self, reason: Option<RpcError>) {
        let announces = self.direction == Direction::Outbound || self.method.requires_response;
        let announce_error = match self.direction {
            Direction::Inbound => {
                self.method.requires_response
                    && matches!(
                        reason,
                        Some(RpcError::Call(_)) | Some(RpcError::Timeout) | Some(RpcError::Shutdown)
                    )
            }
            Direction::Outbound => matches!(reason, Some(RpcError::Call(_))),
        };
        let (error_frame, end_frame) = {
            let mut s = self.state.lock();
            if s.closed {
                return;
            }
            s.closed = true;
            s.close_reason = reason.clone();
            if let Some(timer) = s.timer.take() {
                timer.abort();
            }

            let mut error_frame = None;
            if announce_error {
                let wire = reason.as_ref().map(RpcError::to_wire).unwrap_or_default();
                let meta = match self.direction {
                    Direction::Inbound => Meta::response(self.transmission_id)
                        .with_flags(PacketFlags::END_STREAM)
                        .failed(),
                    Direction::Outbound => {
                        Meta::request(self.transmission_id, self.method.name.as_ref())
                            .with_flags(PacketFlags::CANCEL)
                    }
                };
                error_frame = Some((meta, wire));
                s.sent_end = true;
            }

            let mut end_frame = None;
            if announces && self.send_streaming() && !s.sent_end {
                let meta = match self.direction {
                    Direction::Inbound => {
                        Meta::response(self.transmission_id).with_flags(PacketFlags::END_STREAM)
                    }
                    Direction::Outbound => {
                        Meta::request(self.transmission_id, self.method.name.as_ref())
                            .with_flags(PacketFlags::END_STREAM)
                    }
                };
                end_frame = Some(meta);
                s.sent_end = true;
            }
            (error_frame, end_frame)
        };

        tracing::debug!(
            transmission_id = self.transmission_id,
            method = %self.method.name,
            direction = ?self.direction,
            reason = reason.as_ref().map(tracing::field::display),
            "context closed"
        );

        // The connection may already be gone; closing stays best-effort.
        if let Some((meta, wire)) = error_frame {
            let _ = self.conn.send_error_frame(meta, wire).await;
        }
        if let Some(meta) = end_frame {
            let _ = self.conn.send_frame(meta, Bytes::new()).await;
        }

        self.conn.release_context(self.transmission_id);
        self.wakeup.notify_one();
    }

    async fn cancel(&self, reason: RpcError) {
        {
            let mut s = self.state.lock();
            if s.closed {
                return;
            }
            s.cancelled = true;
        }
        self.close(Some(reason)).await;
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }
}

macro_rules! context_wrapper {
    ($name:ident, $direction:expr) => {
        #[derive(Clone)]
        pub struct $name {
            core: Arc<ContextCore>,
        }

        impl $name {
            pub(crate) fn new(
                conn: ConnectionHandle,
                transmission_id: u32,
                method: MethodDesc,
            ) -> Self {
                Self {
                    core: ContextCore::new(conn, transmission_id, method, $direction),
                }
            }

            pub fn transmission_id(&self) -> u32 {
                self.core.transmission_id
            }

            pub fn method(&self) -> &MethodDesc {
                &self.core.method
            }

            pub fn is_closed(&self) -> bool {
                self.core.is_closed()
            }

            pub fn is_cancelled(&self) -> bool {
                self.core.is_cancelled()
            }

            /// Wait for the next message; `Ok(None)` is end-of-stream.
            pub async fn recv_message(&self) -> Result<Option<Bytes>, RpcError> {
                self.core.recv_message().await
            }

            /// Send one message, marking it as the stream end when `end`.
            pub async fn send_message(
                &self,
                payload: Bytes,
                end: bool,
            ) -> Result<(), RpcError> {
                self.core.send_message(payload, end).await
            }

            pub async fn close(&self, reason: Option<RpcError>) {
                self.core.close(reason).await
            }

            pub async fn cancel(&self, reason: RpcError) {
                self.core.cancel(reason).await
            }

            pub(crate) fn feed_message(
                &self,
                meta: &Meta,
                payload: Bytes,
            ) -> Result<(), RpcError> {
                self.core.feed_message(meta, payload)
            }

            pub(crate) fn arm_timeout(&self, timeout: Duration) {
                let ctx = self.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    tracing::debug!(
                        transmission_id = ctx.transmission_id(),
                        method = %ctx.method().name,
                        "context timed out"
                    );
                    ctx.core.cancel(RpcError::Timeout).await;
                });
                self.core.state.lock().timer = Some(handle.abort_handle());
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("transmission_id", &self.core.transmission_id)
                    .field("method", &self.core.method.name)
                    .finish_non_exhaustive()
            }
        }
    };
}

context_wrapper!(InboundContext, Direction::Inbound);
context_wrapper!(OutboundContext, Direction::Outbound);

impl InboundContext {
    /// Drive the routed method implementation to completion.
    ///
    /// A call-visible error (application error, timeout) closes the context
    /// with an error response and leaves the connection open; anything else
    /// propagates to the handler and tears the connection down.
    pub(crate) async fn run(self, implementation: MethodImpl) -> Result<(), RpcError> {
        let fut = implementation(self.clone());
        match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {
                self.close(None).await;
                Ok(())
            }
            Ok(Err(e)) if !e.is_fatal() => {
                tracing::debug!(
                    transmission_id = self.transmission_id(),
                    error = %e,
                    "method implementation returned a call error"
                );
                self.close(Some(e)).await;
                Ok(())
            }
            Ok(Err(e)) => {
                self.close(Some(e.clone())).await;
                Err(e)
            }
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                let e = RpcError::Internal(format!("panic in method implementation: {msg}"));
                self.close(Some(e.clone())).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::CallKind;

    fn inbound(kind: CallKind) -> InboundContext {
        InboundContext::new(ConnectionHandle::dangling(), 1, MethodDesc::new("t.T.M", kind))
    }

    fn request(end: bool) -> Meta {
        let meta = Meta::request(1, "t.T.M");
        if end {
            meta.with_flags(PacketFlags::END_STREAM)
        } else {
            meta
        }
    }

    #[tokio::test]
    async fn fed_messages_come_out_in_order() {
        let ctx = inbound(CallKind::StreamUnary);
        ctx.feed_message(&request(false), Bytes::from_static(b"m1"))
            .unwrap();
        ctx.feed_message(&request(true), Bytes::from_static(b"m2"))
            .unwrap();

        assert_eq!(ctx.recv_message().await.unwrap().unwrap(), "m1");
        assert_eq!(ctx.recv_message().await.unwrap().unwrap(), "m2");
        assert_eq!(ctx.recv_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn second_request_on_unary_method_is_a_violation() {
        let ctx = inbound(CallKind::UnaryUnary);
        ctx.feed_message(&request(true), Bytes::from_static(b"m1"))
            .unwrap();
        assert!(matches!(
            ctx.feed_message(&request(true), Bytes::from_static(b"m2")),
            Err(RpcError::Contract(
                ContractViolation::MultipleRequestForUnaryMethod { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn second_recv_on_a_unary_method_is_a_violation() {
        let ctx = inbound(CallKind::UnaryUnary);
        ctx.feed_message(&request(true), Bytes::from_static(b"m1"))
            .unwrap();
        assert_eq!(ctx.recv_message().await.unwrap().unwrap(), "m1");
        assert!(matches!(
            ctx.recv_message().await,
            Err(RpcError::Contract(
                ContractViolation::RequestAlreadyReceived { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn response_frame_on_inbound_context_is_a_violation() {
        let ctx = inbound(CallKind::UnaryUnary);
        assert!(matches!(
            ctx.feed_message(&Meta::response(1), Bytes::new()),
            Err(RpcError::Contract(
                ContractViolation::UnexpectedPacketType { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn concurrent_recv_is_rejected_not_serialized() {
        let ctx = inbound(CallKind::StreamUnary);

        let waiting = ctx.clone();
        let task = tokio::spawn(async move { waiting.recv_message().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            ctx.recv_message().await,
            Err(RpcError::RecvInProgress)
        ));

        ctx.feed_message(&request(true), Bytes::from_static(b"m1"))
            .unwrap();
        assert_eq!(task.await.unwrap().unwrap().unwrap(), "m1");
    }

    #[tokio::test]
    async fn cancel_unblocks_a_suspended_recv_with_the_reason() {
        let ctx = inbound(CallKind::UnaryUnary);

        let waiting = ctx.clone();
        let task = tokio::spawn(async move { waiting.recv_message().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        ctx.cancel(RpcError::Timeout).await;
        assert!(matches!(task.await.unwrap(), Err(RpcError::Timeout)));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn void_method_resolves_recv_immediately_on_the_caller_side() {
        let mut desc = MethodDesc::new("t.T.Notify", CallKind::UnaryUnary);
        desc.requires_response = false;
        let ctx = OutboundContext::new(ConnectionHandle::dangling(), 1, desc);
        assert_eq!(ctx.recv_message().await.unwrap(), None);
    }
}
