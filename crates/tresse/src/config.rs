//! Engine configuration.
//!
//! Plain structs with defaults; the runtime knobs also honor environment
//! overrides (`TRESSE_MAX_PACKET`, `TRESSE_CALL_TIMEOUT_MS`,
//! `TRESSE_MAX_CONNECTIONS`).

use std::sync::Arc;
use std::time::Duration;

use tresse_core::{DEFAULT_MAX_PACKET, MetaCodec, MsgpackCodec};

/// How a connection schedules inbound call tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Strict FIFO, one task at a time.
    Serial,
    /// Bounded concurrency through a worker pool.
    Parallel { concurrency: usize },
}

impl DispatchMode {
    /// Default worker-pool bound for parallel dispatch.
    pub const DEFAULT_CONCURRENCY: usize = 5;

    pub fn parallel() -> Self {
        Self::Parallel {
            concurrency: Self::DEFAULT_CONCURRENCY,
        }
    }
}

impl Default for DispatchMode {
    fn default() -> Self {
        Self::Serial
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()?
        .parse::<u64>()
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// Per-connection settings.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Meta codec shared by framing and error payloads.
    pub codec: Arc<dyn MetaCodec>,
    /// Payload ceiling for a single frame; exceeding it is fatal.
    pub max_packet: usize,
    pub dispatch: DispatchMode,
    /// Default timeout applied to every context, unless overridden per
    /// call. `None` means no timeout.
    pub call_timeout: Option<Duration>,
    /// Keep the connection open for write-only use after the peer
    /// half-closes.
    pub keep_open_on_eof: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            codec: Arc::new(MsgpackCodec),
            max_packet: env_usize("TRESSE_MAX_PACKET").unwrap_or(DEFAULT_MAX_PACKET),
            dispatch: DispatchMode::default(),
            call_timeout: env_millis("TRESSE_CALL_TIMEOUT_MS"),
            keep_open_on_eof: false,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("max_packet", &self.max_packet)
            .field("dispatch", &self.dispatch)
            .field("call_timeout", &self.call_timeout)
            .field("keep_open_on_eof", &self.keep_open_on_eof)
            .finish_non_exhaustive()
    }
}

/// Channel-wide settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Admission-control ceiling on concurrent connections.
    pub max_connections: usize,
    /// Maximum consecutive accepts per wake-up. High values favor high
    /// connection rates, low values favor established connections.
    pub max_accept: usize,
    pub connection: ConnectionConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_connections: env_usize("TRESSE_MAX_CONNECTIONS").unwrap_or(10_000),
            max_accept: 64,
            connection: ConnectionConfig::default(),
        }
    }
}
