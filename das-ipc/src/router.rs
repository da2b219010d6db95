//! Component K — Forwarding Router.
//!
//! A pure in-memory routing table from a target object to the session that
//! owns it. No I/O of its own: the run-loop and connection manager ask
//! [`ForwardingRouter::route`] where a frame addressed to a given object
//! should go, then do the actual send themselves over whichever transport
//! serves that session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{IpcError, Result};
use crate::header::MessageHeader;
use crate::object_id::ObjectId;

/// Where a message addressed to a given object should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTarget {
    pub session_id: u16,
}

/// Routing key: object id plus the interface it's being addressed through,
/// since a single object can expose more than one registered interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RouteKey {
    session_id: u16,
    generation: u16,
    local_id: u32,
    interface_id: u32,
}

impl RouteKey {
    fn new(object: ObjectId, interface_id: u32) -> Self {
        Self {
            session_id: object.session_id,
            generation: object.generation,
            local_id: object.local_id,
            interface_id,
        }
    }
}

/// Process-wide routing table (§4.K). Routes are added when an object is
/// published for remote access and removed when it is unregistered or its
/// owning session disconnects.
#[derive(Default)]
pub struct ForwardingRouter {
    routes: RwLock<HashMap<RouteKey, RouteTarget>>,
    routed: AtomicU64,
    failed: AtomicU64,
}

impl ForwardingRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&self, object: ObjectId, interface_id: u32, target: RouteTarget) {
        self.routes
            .write()
            .insert(RouteKey::new(object, interface_id), target);
    }

    pub fn remove_route(&self, object: ObjectId, interface_id: u32) {
        self.routes.write().remove(&RouteKey::new(object, interface_id));
    }

    /// Drop every route whose target is `session_id`, e.g. on disconnect.
    pub fn remove_routes_for_session(&self, session_id: u16) {
        self.routes.write().retain(|_, target| target.session_id != session_id);
    }

    /// Resolve where `header`'s target object should be forwarded,
    /// bumping the success/failure counters as it goes.
    pub fn route(&self, header: &MessageHeader) -> Result<RouteTarget> {
        let key = RouteKey::new(header.target_object(), header.interface_id);
        match self.routes.read().get(&key).copied() {
            Some(target) => {
                self.routed.fetch_add(1, Ordering::Relaxed);
                Ok(target)
            }
            None => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(IpcError::ObjectNotFound)
            }
        }
    }

    pub fn routed_count(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::MessageType;

    fn header_for(object: ObjectId, interface_id: u32) -> MessageHeader {
        MessageHeader::for_object(1, MessageType::Request, interface_id, 1, object, 0)
    }

    #[test]
    fn route_resolves_target_after_add() {
        let router = ForwardingRouter::new();
        let object = ObjectId::new(5, 1, 10);
        router.add_route(object, 42, RouteTarget { session_id: 5 });

        let target = router.route(&header_for(object, 42)).unwrap();
        assert_eq!(target.session_id, 5);
        assert_eq!(router.routed_count(), 1);
        assert_eq!(router.failed_count(), 0);
    }

    #[test]
    fn route_for_unknown_object_fails_and_counts() {
        let router = ForwardingRouter::new();
        let object = ObjectId::new(5, 1, 10);
        assert_eq!(router.route(&header_for(object, 42)), Err(IpcError::ObjectNotFound));
        assert_eq!(router.failed_count(), 1);
    }

    #[test]
    fn remove_route_makes_it_unresolvable_again() {
        let router = ForwardingRouter::new();
        let object = ObjectId::new(5, 1, 10);
        router.add_route(object, 42, RouteTarget { session_id: 5 });
        router.remove_route(object, 42);
        assert!(router.route(&header_for(object, 42)).is_err());
    }

    #[test]
    fn remove_routes_for_session_clears_only_that_sessions_targets() {
        let router = ForwardingRouter::new();
        let a = ObjectId::new(5, 1, 10);
        let b = ObjectId::new(6, 1, 11);
        router.add_route(a, 42, RouteTarget { session_id: 5 });
        router.add_route(b, 42, RouteTarget { session_id: 6 });

        router.remove_routes_for_session(5);
        assert!(router.route(&header_for(a, 42)).is_err());
        assert!(router.route(&header_for(b, 42)).is_ok());
    }

    #[test]
    fn distinct_interfaces_on_the_same_object_route_independently() {
        let router = ForwardingRouter::new();
        let object = ObjectId::new(5, 1, 10);
        router.add_route(object, 1, RouteTarget { session_id: 5 });

        assert!(router.route(&header_for(object, 1)).is_ok());
        assert!(router.route(&header_for(object, 2)).is_err());
    }
}
