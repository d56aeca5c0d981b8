//! Engine error taxonomy and the error-code registry.
//!
//! Errors split into classes with different blast radii:
//!
//! - framing and protocol-discipline errors are fatal to the connection (a
//!   corrupt stream or a buggy peer, not a single bad call);
//! - [`CallError`] is a tagged "expected" application error, serialized into
//!   a structured error response and delivered only to the awaiting context;
//! - timeouts are scoped to the single context that timed out.
//!
//! Everything is `Clone`: when a connection dies, one reason is handed to
//! every outstanding context.

use core::fmt;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use tresse_core::{CodecError, ErrorMessage, ProtocolError, TransportError};

/// Well-known error codes carried in wire error payloads.
///
/// Application services register their own codes above `code::RESERVED_MAX`
/// through [`ErrorRegistry::register`].
pub mod code {
    pub const INTERNAL: u32 = 1;
    pub const TIMEOUT: u32 = 2;
    pub const SHUTDOWN: u32 = 3;
    pub const SERVER_PAUSED: u32 = 4;
    pub const CONNECTION_LIMIT: u32 = 5;
    pub const NOT_FOUND: u32 = 6;

    /// Codes at or below this value are reserved for the engine.
    pub const RESERVED_MAX: u32 = 99;
}

/// A tagged "expected" application error.
///
/// Raised intentionally by method implementations; caught at the context
/// boundary and serialized into a structured error response. The connection
/// stays open.
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub code: u32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl CallError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(code::INTERNAL, message)
    }

    pub fn not_found(method: &str) -> Self {
        Self::new(code::NOT_FOUND, "service method not found")
            .with_data(serde_json::json!({ "name": method }))
    }

    pub fn server_paused() -> Self {
        Self::new(code::SERVER_PAUSED, "server paused accepting new connections")
    }

    pub fn connection_limit() -> Self {
        Self::new(code::CONNECTION_LIMIT, "server is full")
    }

    /// Serialize into the wire error payload.
    pub fn to_wire(&self) -> ErrorMessage {
        ErrorMessage {
            code: self.code,
            message: self.message.clone(),
            data: self
                .data
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_default(),
        }
    }

    /// Rebuild from a wire error payload, resolving the registered name.
    pub fn from_wire(wire: &ErrorMessage) -> Self {
        Self {
            code: wire.code,
            message: wire.message.clone(),
            data: if wire.data.is_empty() {
                None
            } else {
                serde_json::from_str(&wire.data).ok()
            },
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ErrorRegistry::name_of(self.code) {
            Some(name) => write!(f, "{name}({}): {}", self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for CallError {}

/// Process-global table mapping numeric error codes to names.
///
/// Populated by explicit registration at service init; a duplicate code is a
/// startup-time fatal error, not a runtime surprise.
pub struct ErrorRegistry;

static REGISTRY: OnceLock<Mutex<HashMap<u32, &'static str>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<u32, &'static str>> {
    REGISTRY.get_or_init(|| {
        let mut table = HashMap::new();
        table.insert(code::INTERNAL, "Internal");
        table.insert(code::TIMEOUT, "Timeout");
        table.insert(code::SHUTDOWN, "Shutdown");
        table.insert(code::SERVER_PAUSED, "ServerPaused");
        table.insert(code::CONNECTION_LIMIT, "ConnectionLimit");
        table.insert(code::NOT_FOUND, "NotFound");
        Mutex::new(table)
    })
}

impl ErrorRegistry {
    /// Register an application error code.
    ///
    /// # Panics
    ///
    /// Panics if `code` is already registered or falls in the reserved
    /// range.
    pub fn register(code: u32, name: &'static str) {
        assert!(
            code > code::RESERVED_MAX,
            "error code {code} is in the engine-reserved range (<= {})",
            code::RESERVED_MAX
        );
        let mut table = registry().lock().unwrap();
        if let Some(existing) = table.get(&code).copied() {
            // Panic without the guard held, so the table stays usable.
            drop(table);
            panic!("error code {code} registered twice: {existing} and {name}");
        }
        table.insert(code, name);
    }

    pub fn name_of(code: u32) -> Option<&'static str> {
        registry().lock().unwrap().get(&code).copied()
    }
}

/// Protocol-discipline violations.
///
/// These indicate a buggy peer (when detected on the feed path) or a misused
/// context (when detected on the local send/recv path). Fed-path violations
/// are fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    /// Peer sent a second request message on a unary-request method.
    MultipleRequestForUnaryMethod { method: String, transmission_id: u32 },
    /// Peer sent a second response message on a unary-response method.
    MultipleResponseForUnaryMethod { method: String, transmission_id: u32 },
    /// Local caller sent a second request on a unary-request method.
    RequestAlreadySent { method: String, transmission_id: u32 },
    /// Local caller received a second request on a unary-request method.
    RequestAlreadyReceived { method: String, transmission_id: u32 },
    /// Local caller sent a second response on a unary-response method.
    ResponseAlreadySent { method: String, transmission_id: u32 },
    /// Local caller received a second response on a unary-response method.
    ResponseAlreadyReceived { method: String, transmission_id: u32 },
    /// Frame packet type does not match the context direction.
    UnexpectedPacketType { transmission_id: u32 },
    /// Peer-allocated transmission id from the wrong id subspace.
    InvalidTransmissionId { transmission_id: u32 },
    /// The outbound id counter reached the id-space ceiling. Fatal per
    /// connection: recycling ids would break the collision-free invariant.
    TransmissionIdExhausted { next: u64 },
}

impl ContractViolation {
    fn describe(&self) -> (&'static str, &str, u64) {
        match self {
            Self::MultipleRequestForUnaryMethod {
                method,
                transmission_id,
            } => (
                "multiple requests for unary method",
                method,
                u64::from(*transmission_id),
            ),
            Self::MultipleResponseForUnaryMethod {
                method,
                transmission_id,
            } => (
                "multiple responses for unary method",
                method,
                u64::from(*transmission_id),
            ),
            Self::RequestAlreadySent {
                method,
                transmission_id,
            } => ("request already sent", method, u64::from(*transmission_id)),
            Self::RequestAlreadyReceived {
                method,
                transmission_id,
            } => (
                "request already received",
                method,
                u64::from(*transmission_id),
            ),
            Self::ResponseAlreadySent {
                method,
                transmission_id,
            } => ("response already sent", method, u64::from(*transmission_id)),
            Self::ResponseAlreadyReceived {
                method,
                transmission_id,
            } => (
                "response already received",
                method,
                u64::from(*transmission_id),
            ),
            Self::UnexpectedPacketType { transmission_id } => {
                ("unexpected packet type", "", u64::from(*transmission_id))
            }
            Self::InvalidTransmissionId { transmission_id } => {
                ("invalid transmission id", "", u64::from(*transmission_id))
            }
            Self::TransmissionIdExhausted { next } => ("transmission id space exhausted", "", *next),
        }
    }
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (what, method, id) = self.describe();
        if method.is_empty() {
            write!(f, "{what} (transmission_id={id})")
        } else {
            write!(f, "{what} (method={method}, transmission_id={id})")
        }
    }
}

impl std::error::Error for ContractViolation {}

/// Top-level engine error.
#[derive(Debug, Clone)]
pub enum RpcError {
    /// Framing failure. Fatal to the connection.
    Protocol(ProtocolError),
    /// Streaming-contract or id-discipline violation.
    Contract(ContractViolation),
    /// Transport-level failure.
    Transport(TransportError),
    /// Tagged application error; the connection stays open.
    Call(CallError),
    /// The single context timed out. Sibling contexts are unaffected.
    Timeout,
    /// The connection (or channel) is shutting down; no new outbound work.
    Shutdown,
    /// The connection is gone.
    ConnectionClosed,
    /// A second `recv_message` while one is already suspended.
    RecvInProgress,
    /// Unexpected failure (panic in a method implementation).
    Internal(String),
}

impl RpcError {
    /// Whether this error tears down the whole connection, as opposed to
    /// resolving a single call.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(_)
            | Self::Contract(_)
            | Self::Transport(_)
            | Self::Internal(_)
            | Self::RecvInProgress => true,
            Self::Call(_) | Self::Timeout | Self::Shutdown | Self::ConnectionClosed => false,
        }
    }

    /// The wire error payload announcing this error to the peer.
    pub fn to_wire(&self) -> ErrorMessage {
        match self {
            Self::Call(e) => e.to_wire(),
            Self::Timeout => ErrorMessage {
                code: code::TIMEOUT,
                message: "context action timeout".into(),
                data: String::new(),
            },
            Self::Shutdown => ErrorMessage {
                code: code::SHUTDOWN,
                message: "shutting down".into(),
                data: String::new(),
            },
            other => ErrorMessage {
                code: code::INTERNAL,
                message: other.to_string(),
                data: String::new(),
            },
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Contract(e) => write!(f, "contract violation: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Call(e) => write!(f, "call error: {e}"),
            Self::Timeout => write!(f, "context action timeout"),
            Self::Shutdown => write!(f, "shutting down"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::RecvInProgress => {
                write!(f, "recv_message already in progress on this context")
            }
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            Self::Contract(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::Call(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for RpcError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<ContractViolation> for RpcError {
    fn from(e: ContractViolation) -> Self {
        Self::Contract(e)
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<CallError> for RpcError {
    fn from(e: CallError) -> Self {
        Self::Call(e)
    }
}

impl From<CodecError> for RpcError {
    fn from(e: CodecError) -> Self {
        Self::Protocol(ProtocolError::Codec(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(RpcError::Contract(ContractViolation::UnexpectedPacketType { transmission_id: 1 })
            .is_fatal());
        assert!(!RpcError::Call(CallError::internal("x")).is_fatal());
        assert!(!RpcError::Timeout.is_fatal());
    }

    #[test]
    fn call_error_wire_round_trip() {
        let err = CallError::not_found("a.B.c");
        let wire = err.to_wire();
        assert_eq!(wire.code, code::NOT_FOUND);
        let back = CallError::from_wire(&wire);
        assert_eq!(back, err);
    }

    #[test]
    #[should_panic(expected = "engine-reserved range")]
    fn reserved_code_registration_panics() {
        ErrorRegistry::register(code::NOT_FOUND, "Clash");
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_code_registration_panics() {
        ErrorRegistry::register(40_001, "First");
        ErrorRegistry::register(40_001, "Second");
    }
}
