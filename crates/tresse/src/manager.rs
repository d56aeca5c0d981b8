//! Transmission-id allocation and the per-connection call registry.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tresse_core::Meta;

use crate::connection::ConnectionHandle;
use crate::context::{InboundContext, OutboundContext};
use crate::error::{ContractViolation, RpcError};
use crate::method::MethodDesc;

/// Connection role. Determines the transmission-id subspace this endpoint
/// allocates from: the initiator uses odd ids (1, 3, 5, ...), the acceptor
/// even ids (2, 4, 6, ...), so the two sides never collide on one
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Ceiling of the transmission-id space.
pub const MAX_TRANSMISSION_ID: u64 = u32::MAX as u64;

pub(crate) enum ContextRef {
    Inbound(InboundContext),
    Outbound(OutboundContext),
}

impl ContextRef {
    pub(crate) fn feed_message(&self, meta: &Meta, payload: Bytes) -> Result<(), RpcError> {
        match self {
            Self::Inbound(ctx) => ctx.feed_message(meta, payload),
            Self::Outbound(ctx) => ctx.feed_message(meta, payload),
        }
    }

    pub(crate) async fn cancel(&self, reason: RpcError) {
        match self {
            Self::Inbound(ctx) => ctx.cancel(reason).await,
            Self::Outbound(ctx) => ctx.cancel(reason).await,
        }
    }
}

impl Clone for ContextRef {
    fn clone(&self) -> Self {
        match self {
            Self::Inbound(ctx) => Self::Inbound(ctx.clone()),
            Self::Outbound(ctx) => Self::Outbound(ctx.clone()),
        }
    }
}

/// Owns every live context of one connection, keyed by transmission id.
///
/// Release is explicit: a context removes itself on close, and
/// `cancel_all` drains whatever remains when the connection dies.
pub struct ContextManager {
    role: Role,
    contexts: Mutex<HashMap<u32, ContextRef>>,
    /// Monotonic, stepping by 2; u64 so the ceiling check cannot wrap.
    next_outbound_id: Mutex<u64>,
}

impl ContextManager {
    pub(crate) fn new(role: Role) -> Self {
        let seed = match role {
            Role::Initiator => 1,
            Role::Acceptor => 2,
        };
        Self {
            role,
            contexts: Mutex::new(HashMap::new()),
            next_outbound_id: Mutex::new(seed),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next transmission id for a context initiated by this endpoint.
    ///
    /// Exceeding the id space is a hard allocation error: recycling ids
    /// would break the collision-free invariant, so the connection must be
    /// replaced instead.
    pub fn next_transmission_id(&self) -> Result<u32, RpcError> {
        let mut next = self.next_outbound_id.lock();
        if *next > MAX_TRANSMISSION_ID {
            return Err(ContractViolation::TransmissionIdExhausted { next: *next }.into());
        }
        let id = *next as u32;
        *next += 2;
        Ok(id)
    }

    pub(crate) fn new_outbound(
        &self,
        conn: ConnectionHandle,
        method: MethodDesc,
        timeout: Option<Duration>,
    ) -> Result<OutboundContext, RpcError> {
        let transmission_id = self.next_transmission_id()?;
        let ctx = OutboundContext::new(conn, transmission_id, method);
        self.contexts
            .lock()
            .insert(transmission_id, ContextRef::Outbound(ctx.clone()));
        if let Some(timeout) = timeout {
            ctx.arm_timeout(timeout);
        }
        Ok(ctx)
    }

    pub(crate) fn new_inbound(
        &self,
        conn: ConnectionHandle,
        transmission_id: u32,
        method: MethodDesc,
        timeout: Option<Duration>,
    ) -> Result<InboundContext, RpcError> {
        // Peer-allocated ids must come from the peer's subspace.
        let peer_parity = match self.role {
            Role::Initiator => 0,
            Role::Acceptor => 1,
        };
        if transmission_id % 2 != peer_parity {
            return Err(ContractViolation::InvalidTransmissionId { transmission_id }.into());
        }
        let ctx = InboundContext::new(conn, transmission_id, method);
        {
            let mut contexts = self.contexts.lock();
            if contexts.contains_key(&transmission_id) {
                return Err(ContractViolation::InvalidTransmissionId { transmission_id }.into());
            }
            contexts.insert(transmission_id, ContextRef::Inbound(ctx.clone()));
        }
        if let Some(timeout) = timeout {
            ctx.arm_timeout(timeout);
        }
        Ok(ctx)
    }

    pub(crate) fn get(&self, transmission_id: u32) -> Option<ContextRef> {
        self.contexts.lock().get(&transmission_id).cloned()
    }

    /// Explicit ownership break; idempotent.
    pub(crate) fn release(&self, transmission_id: u32) {
        self.contexts.lock().remove(&transmission_id);
    }

    /// Cancel every remaining context with the same reason.
    pub(crate) async fn cancel_all(&self, reason: RpcError) {
        let drained: Vec<ContextRef> = {
            let mut contexts = self.contexts.lock();
            contexts.drain().map(|(_, ctx)| ctx).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(
                count = drained.len(),
                reason = %reason,
                "cancelling all outstanding contexts"
            );
        }
        for ctx in drained {
            ctx.cancel(reason.clone()).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn set_next_outbound_id(&self, next: u64) {
        *self.next_outbound_id.lock() = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::CallKind;

    fn desc() -> MethodDesc {
        MethodDesc::new("echo.Echo.Unary", CallKind::UnaryUnary)
    }

    #[tokio::test]
    async fn initiator_allocates_odd_ids() {
        let manager = ContextManager::new(Role::Initiator);
        let ids: Vec<u32> = (0..4)
            .map(|_| manager.next_transmission_id().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 3, 5, 7]);
    }

    #[tokio::test]
    async fn acceptor_allocates_even_ids() {
        let manager = ContextManager::new(Role::Acceptor);
        let ids: Vec<u32> = (0..4)
            .map(|_| manager.next_transmission_id().unwrap())
            .collect();
        assert_eq!(ids, vec![2, 4, 6, 8]);
    }

    #[tokio::test]
    async fn id_exhaustion_is_a_hard_error() {
        let manager = ContextManager::new(Role::Initiator);
        manager.set_next_outbound_id(MAX_TRANSMISSION_ID);
        assert_eq!(
            manager.next_transmission_id().unwrap(),
            MAX_TRANSMISSION_ID as u32
        );
        assert!(matches!(
            manager.next_transmission_id(),
            Err(RpcError::Contract(
                ContractViolation::TransmissionIdExhausted { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn inbound_parity_is_validated() {
        let manager = ContextManager::new(Role::Acceptor);
        // The acceptor's peer is the initiator: odd ids only.
        assert!(
            manager
                .new_inbound(ConnectionHandle::dangling(), 3, desc(), None)
                .is_ok()
        );
        assert!(matches!(
            manager.new_inbound(ConnectionHandle::dangling(), 4, desc(), None),
            Err(RpcError::Contract(
                ContractViolation::InvalidTransmissionId { transmission_id: 4 }
            ))
        ));
    }

    #[tokio::test]
    async fn reused_inbound_id_is_rejected() {
        let manager = ContextManager::new(Role::Acceptor);
        manager
            .new_inbound(ConnectionHandle::dangling(), 1, desc(), None)
            .unwrap();
        assert!(matches!(
            manager.new_inbound(ConnectionHandle::dangling(), 1, desc(), None),
            Err(RpcError::Contract(
                ContractViolation::InvalidTransmissionId { .. }
            ))
        ));
    }
}
