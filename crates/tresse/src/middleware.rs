//! Channel lifecycle middleware.
//!
//! Middlewares observe connection and channel lifecycle events in
//! registration order. Every hook has a no-op default, so implementations
//! override only what they care about.

use std::sync::Arc;

use crate::channel::Channel;
use crate::connection::Connection;

pub trait Middleware: Send + Sync + 'static {
    fn on_connection_made(&self, _channel: &Channel, _conn: &Connection) {}
    fn on_connection_lost(&self, _channel: &Channel, _conn: &Connection) {}
    fn on_start(&self, _channel: &Channel) {}
    fn on_pause(&self, _channel: &Channel) {}
    fn on_shutdown(&self, _channel: &Channel) {}
    fn on_close(&self, _channel: &Channel) {}
}

/// Ordered middleware dispatch point.
#[derive(Clone, Default)]
pub struct MiddlewareManager {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub(crate) fn connection_made(&self, channel: &Channel, conn: &Connection) {
        for m in &self.middlewares {
            m.on_connection_made(channel, conn);
        }
    }

    pub(crate) fn connection_lost(&self, channel: &Channel, conn: &Connection) {
        for m in &self.middlewares {
            m.on_connection_lost(channel, conn);
        }
    }

    pub(crate) fn start(&self, channel: &Channel) {
        for m in &self.middlewares {
            m.on_start(channel);
        }
    }

    pub(crate) fn pause(&self, channel: &Channel) {
        for m in &self.middlewares {
            m.on_pause(channel);
        }
    }

    pub(crate) fn shutdown(&self, channel: &Channel) {
        for m in &self.middlewares {
            m.on_shutdown(channel);
        }
    }

    pub(crate) fn close(&self, channel: &Channel) {
        for m in &self.middlewares {
            m.on_close(channel);
        }
    }
}

impl std::fmt::Debug for MiddlewareManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareManager")
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}
