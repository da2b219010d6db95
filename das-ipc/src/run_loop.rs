//! Component J — Run-Loop.
//!
//! Owns the transport's single receive thread; additional application
//! threads call [`RunLoop::send_request`] concurrently. Re-entrancy (a
//! request handler itself issuing a nested `send_request`) works because
//! every inbound `Request` is dispatched to its own worker thread rather
//! than executed synchronously on the receive thread — a literal
//! synchronous dispatch would deadlock the moment a handler tried to call
//! back out while the receive thread was blocked running it
//! (SPEC_FULL.md §4.J, §9 deviation notes).

use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{IpcError, Result};
use crate::header::{MessageHeader, MessageType};
use crate::transport::{Frame, Transport};

pub const MAX_NESTED_DEPTH: u32 = 32;

thread_local! {
    static NESTED_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Injected at run-loop setup: given an inbound request, produce the
/// response header (with `error_code`/`body_size` filled in appropriately)
/// and body to send back. Implemented by the stub side of the Proxy/Stub
/// Factory (component L).
pub trait RequestHandler: Send + Sync {
    fn handle(&self, header: MessageHeader, body: Vec<u8>) -> (MessageHeader, Vec<u8>);
}

struct PendingCall {
    completed: bool,
    response: Option<Frame>,
}

struct Pending {
    calls: HashMap<u64, PendingCall>,
}

/// Poll interval used for `transport.receive(timeout)` inside the receive
/// loop; keeps `stop()` responsive without busy-waiting.
const RECEIVE_POLL: Duration = Duration::from_millis(100);

/// The run-loop (§3.7, §4.J). Generic over the concrete [`Transport`] so it
/// works identically with the loopback transport in tests and the
/// POSIX-mqueue transport in production.
pub struct RunLoop<T: Transport + 'static> {
    transport: Arc<T>,
    next_call_id: AtomicU64,
    pending: Mutex<Pending>,
    cv: Condvar,
    running: Arc<AtomicBool>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
    request_handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    self_weak: std::sync::Weak<RunLoop<T>>,
}

impl<T: Transport + 'static> RunLoop<T> {
    pub fn new(transport: Arc<T>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            transport,
            next_call_id: AtomicU64::new(1),
            pending: Mutex::new(Pending { calls: HashMap::new() }),
            cv: Condvar::new(),
            running: Arc::new(AtomicBool::new(false)),
            io_thread: Mutex::new(None),
            request_handler: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.request_handler.lock() = Some(handler);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the receive-loop thread. Idempotent: calling `run` while
    /// already running is a no-op. Panics if called before the loop has been
    /// wrapped in its owning `Arc` (impossible through `RunLoop::new`, which
    /// hands back `Arc<Self>` directly).
    pub fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.self_weak.upgrade().expect("RunLoop dropped while starting receive thread");
        let handle = std::thread::spawn(move || this.receive_loop());
        *self.io_thread.lock() = Some(handle);
    }

    /// Stop the loop: marks not-running, completes every pending call so
    /// its waiter observes `Timeout`, and joins the receive thread.
    /// Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut pending = self.pending.lock();
            for call in pending.calls.values_mut() {
                call.completed = true;
            }
            self.cv.notify_all();
        }
        if let Some(handle) = self.io_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Send a request and block until its matching response arrives, the
    /// loop stops, or the depth bound is hit.
    ///
    /// Nesting is tracked per calling thread. The depth is decremented via a
    /// scope guard covering every exit path, including a transport send
    /// failure before the wait begins, so a failing send never leaks a
    /// depth slot (§9, resolved open question).
    pub fn send_request(&self, mut header: MessageHeader, body: &[u8]) -> Result<Frame> {
        let depth = NESTED_DEPTH.with(|d| d.get());
        if depth >= MAX_NESTED_DEPTH {
            return Err(IpcError::DeadlockDetected);
        }

        let call_id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
        header.call_id = call_id;
        header.message_type = MessageType::Request;

        {
            let mut pending = self.pending.lock();
            pending.calls.insert(
                call_id,
                PendingCall {
                    completed: false,
                    response: None,
                },
            );
        }

        if let Err(e) = self.transport.send(header, body) {
            self.pending.lock().calls.remove(&call_id);
            return Err(e);
        }

        NESTED_DEPTH.with(|d| d.set(depth + 1));
        let _guard = NestedDepthGuard;

        let mut pending = self.pending.lock();
        loop {
            if let Some(call) = pending.calls.get(&call_id) {
                if call.completed {
                    break;
                }
            } else {
                break;
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.cv.wait_for(&mut pending, Duration::from_millis(200));
        }

        let call = pending.calls.remove(&call_id);
        match call {
            Some(PendingCall {
                completed: true,
                response: Some(frame),
            }) => Ok(frame),
            _ => Err(IpcError::Timeout),
        }
    }

    /// Send a response for a previously received request. One response per
    /// `call_id`.
    pub fn send_response(&self, mut header: MessageHeader, body: &[u8]) -> Result<()> {
        header.message_type = MessageType::Response;
        self.transport.send(header, body)
    }

    /// Fire-and-forget event.
    pub fn send_event(&self, mut header: MessageHeader, body: &[u8]) -> Result<()> {
        header.message_type = MessageType::Event;
        self.transport.send(header, body)
    }

    fn receive_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            match self.transport.receive(RECEIVE_POLL) {
                Ok(frame) => self.dispatch(frame),
                Err(IpcError::Timeout) => continue,
                Err(_) => break,
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame.header.message_type {
            MessageType::Response => {
                let mut pending = self.pending.lock();
                if let Some(call) = pending.calls.get_mut(&frame.header.call_id) {
                    call.response = Some(frame);
                    call.completed = true;
                    self.cv.notify_all();
                } else {
                    tracing::debug!(
                        call_id = frame.header.call_id,
                        "dropped response for unknown or already-resolved call_id"
                    );
                }
            }
            MessageType::Request => {
                let this = self.self_weak.upgrade().expect("RunLoop dropped while dispatching a request");
                // The handler runs on a fresh thread so the receive thread
                // stays free to pump other frames (see module docs), but
                // that means `NESTED_DEPTH` must be carried across the
                // `spawn` by hand — a thread-local doesn't follow the
                // logical call chain on its own, and without this a
                // re-entrant ping-pong would spawn threads forever instead
                // of hitting `MAX_NESTED_DEPTH` (§8 property 7, E6).
                let depth = NESTED_DEPTH.with(|d| d.get());
                std::thread::spawn(move || {
                    NESTED_DEPTH.with(|d| d.set(depth));
                    this.handle_request(frame);
                });
            }
            MessageType::Event | MessageType::Heartbeat => {
                // Control-plane/event handling is layered on top by the
                // caller (connection manager); the run-loop itself has
                // nothing further to do with these message types.
            }
        }
    }

    fn handle_request(&self, frame: Frame) {
        let handler = self.request_handler.lock().clone();
        let Some(handler) = handler else {
            let mut response = frame.header;
            response.message_type = MessageType::Response;
            response.error_code = IpcError::NoInterface.code();
            response.body_size = 0;
            let _ = self.transport.send(response, &[]);
            return;
        };

        let header = frame.header;
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(header, frame.body)));
        let (mut response_header, response_body) = match result {
            Ok(pair) => pair,
            Err(_) => {
                let mut h = header;
                h.error_code = IpcError::InternalFatalError("handler panicked".into()).code();
                (h, Vec::new())
            }
        };
        response_header.message_type = MessageType::Response;
        response_header.call_id = header.call_id;
        let _ = self.transport.send(response_header, &response_body);
    }
}

struct NestedDepthGuard;

impl Drop for NestedDepthGuard {
    fn drop(&mut self) {
        NESTED_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_id::ObjectId;
    use crate::serializer::{Reader, Writer};
    use crate::transport::loopback;

    struct EchoHandler;

    impl RequestHandler for EchoHandler {
        fn handle(&self, header: MessageHeader, body: Vec<u8>) -> (MessageHeader, Vec<u8>) {
            let mut r = Reader::new(&body);
            let n = r.read_i32().unwrap_or(0);
            let mut w = Writer::new();
            w.write_i32(n + 1);
            let mut response = header;
            response.error_code = 0;
            (response, w.into_bytes())
        }
    }

    fn request_header(call_id: u64) -> MessageHeader {
        MessageHeader::for_object(call_id, MessageType::Request, 7, 1, ObjectId::new(1, 1, 1), 0)
    }

    #[test]
    fn round_trip_request_response() {
        let (host_t, peer_t) = loopback::pair(4096, None);
        let host = RunLoop::new(Arc::new(host_t));
        let peer = RunLoop::new(Arc::new(peer_t));
        peer.set_request_handler(Arc::new(EchoHandler));
        host.run();
        peer.run();

        let mut w = Writer::new();
        w.write_i32(41);
        let frame = host.send_request(request_header(0), &w.into_bytes()).unwrap();
        let mut r = Reader::new(&frame.body);
        assert_eq!(r.read_i32().unwrap(), 42);
        assert_eq!(frame.header.error_code, 0);

        host.stop();
        peer.stop();
    }

    #[test]
    fn missing_handler_yields_no_interface_error_code() {
        let (host_t, peer_t) = loopback::pair(4096, None);
        let host = RunLoop::new(Arc::new(host_t));
        let peer = RunLoop::new(Arc::new(peer_t));
        host.run();
        peer.run();

        let frame = host.send_request(request_header(0), &[]).unwrap();
        assert_eq!(frame.header.error_code, IpcError::NoInterface.code());

        host.stop();
        peer.stop();
    }

    #[test]
    fn stop_completes_pending_waiters_with_timeout() {
        let (host_t, _peer_t) = loopback::pair(4096, None);
        let host = Arc::new(RunLoop::new(Arc::new(host_t)));
        host.run();

        let host_clone = Arc::clone(&host);
        let waiter = std::thread::spawn(move || host_clone.send_request(request_header(0), &[]));

        std::thread::sleep(Duration::from_millis(50));
        host.stop();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(IpcError::Timeout)));
    }

    #[test]
    fn deadlock_detected_at_nesting_bound_without_transport_io() {
        let (host_t, _peer_t) = loopback::pair(4096, None);
        let host = RunLoop::new(Arc::new(host_t));
        host.run();

        NESTED_DEPTH.with(|d| d.set(MAX_NESTED_DEPTH));
        let result = host.send_request(request_header(0), &[]);
        NESTED_DEPTH.with(|d| d.set(0));
        assert!(matches!(result, Err(IpcError::DeadlockDetected)));

        host.stop();
    }

    #[test]
    fn nested_reentrant_call_succeeds_within_bound() {
        // R2's handler issues its own nested send_request (R3) while R1 is
        // still outstanding, exercising the re-entrancy the spec requires
        // (E6): the receive thread must stay free to pump other frames
        // while R1 awaits its response.
        struct NestedHandler {
            peer: Arc<RunLoop<crate::transport::FramedTransport<loopback::LoopbackQueue>>>,
        }
        impl RequestHandler for NestedHandler {
            fn handle(&self, header: MessageHeader, _body: Vec<u8>) -> (MessageHeader, Vec<u8>) {
                let nested = self
                    .peer
                    .send_request(request_header(0), &[])
                    .expect("nested call should succeed");
                let mut response = header;
                response.error_code = nested.header.error_code;
                (response, Vec::new())
            }
        }

        let (host_t, peer_t) = loopback::pair(4096, None);
        let host = RunLoop::new(Arc::new(host_t));
        let peer = RunLoop::new(Arc::new(peer_t));
        peer.set_request_handler(Arc::new(EchoHandler));
        host.set_request_handler(Arc::new(NestedHandler { peer: Arc::clone(&peer) }));
        host.run();
        peer.run();

        // peer -> host, host's handler nests a call back to peer.
        let frame = peer.send_request(request_header(0), &[]).unwrap();
        assert_eq!(frame.header.error_code, 0);

        host.stop();
        peer.stop();
    }
}
