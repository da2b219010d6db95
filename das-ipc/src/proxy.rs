//! Component L — Proxy/Stub Factory.
//!
//! [`Proxy`] is the client-side stand-in for a remote object: it marshals a
//! method call into a wire request and blocks on [`crate::run_loop::RunLoop`]
//! for the matching response. [`ProxyStubFactory`] is both the proxy cache
//! (keyed by `ObjectId`) and the server-side dispatcher bound in as the
//! run-loop's [`RequestHandler`](crate::run_loop::RequestHandler): it
//! resolves an inbound request's target object through the Object Manager
//! and hands the call to whichever [`StubDispatch`] is registered for its
//! `interface_id`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{IpcError, Result};
use crate::header::{MessageHeader, MessageType};
use crate::object_id::ObjectId;
use crate::object_manager::{LookupResult, ObjectManager};
use crate::registry::RemoteObjectRegistry;
use crate::run_loop::{RequestHandler, RunLoop};
use crate::transport::Transport;

/// Reserved `method_id` the stub maps onto `ObjectManager::release` rather
/// than forwarding to a per-interface dispatcher, so every proxy can release
/// its remote reference without each interface needing its own opcode for it.
pub const RELEASE_METHOD_ID: u32 = u32::MAX;

/// Per-interface dispatch: given the resolved local object and a method id,
/// decode the arguments, invoke the matching method, and encode the result.
/// Implemented once per interface by generated or hand-written stub code.
pub trait StubDispatch: Send + Sync {
    fn dispatch(&self, object: Arc<dyn Any + Send + Sync>, method_id: u32, body: &[u8]) -> Result<Vec<u8>>;
}

/// Client-side stand-in for a remote object (§4.L).
pub struct Proxy<T: Transport + 'static> {
    object_id: ObjectId,
    interface_id: u32,
    run_loop: Arc<RunLoop<T>>,
}

impl<T: Transport + 'static> Proxy<T> {
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn interface_id(&self) -> u32 {
        self.interface_id
    }

    /// Serialize `args`, send the request, and surface the callee's
    /// `error_code` as an `Err` if negative. `s_ok` (0) and `s_false` (1) are
    /// success variants (§7) and pass the body through.
    pub fn call(&self, method_id: u32, args: &[u8]) -> Result<Vec<u8>> {
        let header = MessageHeader::for_object(
            0,
            MessageType::Request,
            self.interface_id,
            method_id,
            self.object_id,
            args.len() as u32,
        );
        let frame = self.run_loop.send_request(header, args)?;
        if frame.header.error_code < 0 {
            return Err(IpcError::from_wire_code(frame.header.error_code)
                .unwrap_or(IpcError::UndefinedReturnValue));
        }
        Ok(frame.body)
    }

    /// Tell the remote side this proxy no longer holds a reference.
    pub fn release(&self) -> Result<()> {
        self.call(RELEASE_METHOD_ID, &[]).map(|_| ())
    }
}

struct Inner<T: Transport + 'static> {
    object_manager: Arc<ObjectManager>,
    #[allow(dead_code)]
    registry: Arc<RemoteObjectRegistry>,
    run_loop: Arc<RunLoop<T>>,
    proxies: Mutex<HashMap<ObjectId, Arc<Proxy<T>>>>,
    dispatchers: RwLock<HashMap<u32, Arc<dyn StubDispatch>>>,
}

/// Owns both halves of §4.L. Must be [`initialize`](Self::initialize)d
/// before any other operation; every method before that returns
/// `Err(IpcError::InvalidState)`.
pub struct ProxyStubFactory<T: Transport + 'static> {
    inner: RwLock<Option<Inner<T>>>,
}

impl<T: Transport + 'static> Default for ProxyStubFactory<T> {
    fn default() -> Self {
        Self { inner: RwLock::new(None) }
    }
}

impl<T: Transport + 'static> ProxyStubFactory<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(
        &self,
        object_manager: Arc<ObjectManager>,
        registry: Arc<RemoteObjectRegistry>,
        run_loop: Arc<RunLoop<T>>,
    ) {
        *self.inner.write() = Some(Inner {
            object_manager,
            registry,
            run_loop,
            proxies: Mutex::new(HashMap::new()),
            dispatchers: RwLock::new(HashMap::new()),
        });
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.read().is_some()
    }

    /// Bind the dispatcher that will serve every inbound call whose
    /// `interface_id` matches. Replaces any previous registration.
    pub fn register_dispatcher(&self, interface_id: u32, dispatcher: Arc<dyn StubDispatch>) -> Result<()> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(IpcError::InvalidState)?;
        inner.dispatchers.write().insert(interface_id, dispatcher);
        Ok(())
    }

    /// Return the cached proxy for `object_id`, creating it on first use.
    pub fn get_proxy(&self, object_id: ObjectId, interface_id: u32) -> Result<Arc<Proxy<T>>> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(IpcError::InvalidState)?;
        let mut proxies = inner.proxies.lock();
        if let Some(existing) = proxies.get(&object_id) {
            return Ok(Arc::clone(existing));
        }
        let proxy = Arc::new(Proxy {
            object_id,
            interface_id,
            run_loop: Arc::clone(&inner.run_loop),
        });
        proxies.insert(object_id, Arc::clone(&proxy));
        Ok(proxy)
    }

    /// Drop the cached proxy and decrement its local refcount entry, if any
    /// (a proxy's presence in the Object Manager is a tombstone registered
    /// via `register_remote`).
    pub fn release_proxy(&self, object_id: ObjectId) -> Result<()> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(IpcError::InvalidState)?;
        inner.proxies.lock().remove(&object_id);
        let _ = inner.object_manager.release(object_id);
        Ok(())
    }

    pub fn clear_all(&self) -> Result<()> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(IpcError::InvalidState)?;
        inner.proxies.lock().clear();
        Ok(())
    }

    fn dispatch_request(&self, header: &MessageHeader, body: &[u8]) -> Result<Vec<u8>> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(IpcError::InvalidState)?;
        let target = header.target_object();

        if header.method_id == RELEASE_METHOD_ID {
            inner.object_manager.release(target)?;
            return Ok(Vec::new());
        }

        let object = match inner.object_manager.lookup(target) {
            LookupResult::Local(ptr) => ptr,
            LookupResult::Stale => return Err(IpcError::StaleObjectHandle),
            LookupResult::NotLocal | LookupResult::NotFound => return Err(IpcError::ObjectNotFound),
        };

        let dispatcher = inner
            .dispatchers
            .read()
            .get(&header.interface_id)
            .cloned()
            .ok_or(IpcError::NoInterface)?;

        dispatcher.dispatch(object, header.method_id, body)
    }
}

impl<T: Transport + 'static> RequestHandler for ProxyStubFactory<T> {
    fn handle(&self, header: MessageHeader, body: Vec<u8>) -> (MessageHeader, Vec<u8>) {
        let mut response = header;
        match self.dispatch_request(&header, &body) {
            Ok(response_body) => {
                response.error_code = 0;
                (response, response_body)
            }
            Err(e) => {
                response.error_code = e.code();
                (response, Vec::new())
            }
        }
    }
}
