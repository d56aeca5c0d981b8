//! Static method routing.
//!
//! Built once per service set at startup; after `build()` the lookup map is
//! immutable and call-time dispatch is a plain map read. An unknown method
//! name on an inbound request yields a structured not-found error response,
//! never a crash.

use std::collections::HashMap;
use std::sync::Arc;

use crate::method::Method;

/// Immutable `full_name -> Method` lookup map.
pub struct Router {
    routes: HashMap<Arc<str>, Method>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder {
            routes: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Method> {
        self.routes.get(name)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// An empty router, for pure-client connections.
    pub fn empty() -> Router {
        Router {
            routes: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .finish()
    }
}

/// Accumulates method registrations before freezing them into a [`Router`].
pub struct RouterBuilder {
    routes: HashMap<Arc<str>, Method>,
}

impl RouterBuilder {
    /// Register a method.
    ///
    /// # Panics
    ///
    /// A duplicate full name is a startup-time fatal error.
    pub fn route(mut self, method: Method) -> Self {
        let name = method.desc().name.clone();
        if self.routes.insert(name.clone(), method).is_some() {
            panic!("service method {name} registered twice");
        }
        self
    }

    /// Fold another builder's routes into this one, with the same
    /// duplicate check.
    pub fn merge(mut self, other: RouterBuilder) -> Self {
        for (name, method) in other.routes {
            if self.routes.insert(name.clone(), method).is_some() {
                panic!("service method {name} registered twice");
            }
        }
        self
    }

    pub fn build(self) -> Router {
        Router {
            routes: self.routes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::CallKind;

    fn noop(name: &str) -> Method {
        Method::new(name, CallKind::UnaryUnary, |_ctx| async { Ok(()) })
    }

    #[test]
    fn lookup_is_by_full_name() {
        let router = Router::builder()
            .route(noop("math.Adder.Add"))
            .route(noop("math.Adder.Sub"))
            .build();
        assert_eq!(router.len(), 2);
        assert!(router.get("math.Adder.Add").is_some());
        assert!(router.get("math.Adder.Mul").is_none());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_route_panics() {
        let _ = Router::builder()
            .route(noop("math.Adder.Add"))
            .route(noop("math.Adder.Add"));
    }
}
