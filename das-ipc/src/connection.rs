//! Component I (host side) — Connection Manager.
//!
//! Owns the host's table of live child sessions, drives the
//! Hello/Ready/Goodbye state machine on that side, and runs the dedicated
//! heartbeat thread that is the sole writer of timeout-driven disconnects
//! (SPEC_FULL.md §4.I, §5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{IpcError, Result};
use crate::handshake::{ReadyAckStatus, WelcomeStatus};
use crate::registry::RemoteObjectRegistry;
use crate::session::SessionCoordinator;

pub const HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 5_000;

/// Host-side per-connection state machine, mirroring §3.6's `Listening ->
/// HelloRecv -> ReadyRecv -> Connected -> Disconnected`. `WelcomeSent` is the
/// point between `HelloRecv` and `ReadyRecv` where the host is waiting on
/// the child's `ReadyRequest` (named for parity with the host logic in §4.I,
/// step 2, which checks for exactly this state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostConnectionState {
    WelcomeSent,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub session_id: u16,
    pub pid: u32,
    pub plugin_name: String,
    pub state: HostConnectionState,
    pub last_heartbeat_ms: u64,
}

/// Monotonic clock source abstraction so tests can simulate the passage of
/// time instead of sleeping for multiple seconds per the spec's heartbeat
/// timeout.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Callbacks fired on connection lifecycle transitions (§4.I).
pub trait ConnectionCallbacks: Send + Sync {
    fn on_client_connected(&self, _info: &ConnectionInfo) {}
    fn on_client_disconnected(&self, _session_id: u16) {}
}

struct Table {
    connections: HashMap<u16, ConnectionInfo>,
}

/// Host-side connection manager. Holds no transport of its own — callers
/// feed it handshake/heartbeat events and read back the wire response to
/// send, keeping this component pure state plus the heartbeat-scan thread.
pub struct ConnectionManager {
    table: RwLock<Table>,
    sessions: Arc<SessionCoordinator>,
    registry: Arc<RemoteObjectRegistry>,
    clock: Arc<dyn Clock>,
    callbacks: RwLock<Option<Arc<dyn ConnectionCallbacks>>>,
    running: Arc<AtomicBool>,
    heartbeat_thread: parking_lot::Mutex<Option<JoinHandle<()>>>,
    self_weak: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(sessions: Arc<SessionCoordinator>, registry: Arc<RemoteObjectRegistry>) -> Arc<Self> {
        Self::with_clock(sessions, registry, Arc::new(SystemClock::default()))
    }

    pub fn with_clock(
        sessions: Arc<SessionCoordinator>,
        registry: Arc<RemoteObjectRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            table: RwLock::new(Table {
                connections: HashMap::new(),
            }),
            sessions,
            registry,
            clock,
            callbacks: RwLock::new(None),
            running: Arc::new(AtomicBool::new(false)),
            heartbeat_thread: parking_lot::Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn set_callbacks(&self, callbacks: Arc<dyn ConnectionCallbacks>) {
        *self.callbacks.write() = Some(callbacks);
    }

    /// Handle an inbound `HelloRequest`: validate, allocate a session id,
    /// and record the connection as `WelcomeSent`. A `pid` that already has
    /// a live connection still gets a brand new session id (§9, resolved
    /// open question) — the old connection is left untouched here; callers
    /// that want to evict it do so via `unregister` explicitly.
    pub fn on_hello(&self, protocol_version: u32, pid: u32, plugin_name: &str) -> (WelcomeStatus, u16) {
        if protocol_version != crate::handshake::CURRENT_PROTOCOL_VERSION {
            return (WelcomeStatus::VersionMismatch, 0);
        }
        if plugin_name.is_empty() {
            return (WelcomeStatus::InvalidName, 0);
        }
        let session_id = match self.sessions.allocate() {
            Ok(id) => id,
            Err(_) => return (WelcomeStatus::TooManyClients, 0),
        };

        let info = ConnectionInfo {
            session_id,
            pid,
            plugin_name: plugin_name.to_string(),
            state: HostConnectionState::WelcomeSent,
            last_heartbeat_ms: self.clock.now_ms(),
        };
        self.table.write().connections.insert(session_id, info);
        (WelcomeStatus::Ok, session_id)
    }

    /// Handle an inbound `ReadyRequest(session_id)`.
    pub fn on_ready(&self, session_id: u16) -> ReadyAckStatus {
        let mut table = self.table.write();
        let Some(info) = table.connections.get_mut(&session_id) else {
            return ReadyAckStatus::InvalidSession;
        };
        if info.state != HostConnectionState::WelcomeSent {
            return ReadyAckStatus::NotReady;
        }
        info.state = HostConnectionState::Connected;
        let snapshot = info.clone();
        drop(table);

        if let Some(cb) = self.callbacks.read().as_ref() {
            cb.on_client_connected(&snapshot);
        }
        ReadyAckStatus::Ok
    }

    pub fn on_heartbeat(&self, session_id: u16) -> Result<()> {
        let mut table = self.table.write();
        let info = table
            .connections
            .get_mut(&session_id)
            .ok_or(IpcError::ObjectNotFound)?;
        info.last_heartbeat_ms = self.clock.now_ms();
        Ok(())
    }

    /// Handle an inbound `Goodbye`, or a heartbeat-timeout discovery: mark
    /// disconnected, unregister the session's published objects, release
    /// its id, and fire `on_client_disconnected`.
    pub fn disconnect(&self, session_id: u16) {
        let existed = self.table.write().connections.remove(&session_id).is_some();
        if !existed {
            return;
        }
        self.registry.unregister_all_from_session(session_id);
        self.sessions.release(session_id);
        if let Some(cb) = self.callbacks.read().as_ref() {
            cb.on_client_disconnected(session_id);
        }
    }

    pub fn is_alive(&self, session_id: u16) -> bool {
        matches!(
            self.table.read().connections.get(&session_id).map(|c| c.state),
            Some(HostConnectionState::Connected)
        )
    }

    pub fn get(&self, session_id: u16) -> Option<ConnectionInfo> {
        self.table.read().connections.get(&session_id).cloned()
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        self.table.read().connections.values().cloned().collect()
    }

    /// Scan once for sessions whose last heartbeat is older than
    /// `HEARTBEAT_TIMEOUT_MS` and disconnect them. Returns the disconnected
    /// session ids.
    pub fn scan_timeouts(&self) -> Vec<u16> {
        let now = self.clock.now_ms();
        let timed_out: Vec<u16> = {
            let table = self.table.read();
            table
                .connections
                .values()
                .filter(|info| now.saturating_sub(info.last_heartbeat_ms) > HEARTBEAT_TIMEOUT_MS)
                .map(|info| info.session_id)
                .collect()
        };
        for id in &timed_out {
            self.disconnect(*id);
        }
        timed_out
    }

    /// Start the dedicated heartbeat-scanning thread (§4.I, §5). Idempotent.
    /// Panics if called before the manager has been wrapped in its owning
    /// `Arc` (impossible through the public constructors, which hand back
    /// `Arc<Self>` directly).
    pub fn start_heartbeat_thread(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.self_weak.upgrade().expect("ConnectionManager dropped while starting heartbeat thread");
        let running = Arc::clone(&self.running);
        let handle = std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                for id in this.scan_timeouts() {
                    tracing::warn!(session_id = id, "heartbeat timeout, session disconnected");
                }
            }
        });
        *self.heartbeat_thread.lock() = Some(handle);
    }

    pub fn stop_heartbeat_thread(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.heartbeat_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop_heartbeat_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct FakeClock {
        now: AtomicU64,
    }

    impl Clock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn manager_with_fake_clock() -> (Arc<ConnectionManager>, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock { now: AtomicU64::new(0) });
        let mgr = ConnectionManager::with_clock(
            Arc::new(SessionCoordinator::new()),
            Arc::new(RemoteObjectRegistry::new()),
            clock.clone(),
        );
        (mgr, clock)
    }

    #[test]
    fn hello_ready_reaches_connected_with_valid_session() {
        let (mgr, _clock) = manager_with_fake_clock();
        let (status, session_id) = mgr.on_hello(crate::handshake::CURRENT_PROTOCOL_VERSION, 100, "plug");
        assert_eq!(status, WelcomeStatus::Ok);
        assert!(SessionCoordinator::is_valid(session_id));

        let ack = mgr.on_ready(session_id);
        assert_eq!(ack, ReadyAckStatus::Ok);
        assert!(mgr.is_alive(session_id));
    }

    #[test]
    fn ready_on_unknown_session_is_invalid() {
        let (mgr, _clock) = manager_with_fake_clock();
        assert_eq!(mgr.on_ready(999), ReadyAckStatus::InvalidSession);
    }

    #[test]
    fn ready_twice_is_not_ready_the_second_time() {
        let (mgr, _clock) = manager_with_fake_clock();
        let (_, session_id) = mgr.on_hello(crate::handshake::CURRENT_PROTOCOL_VERSION, 1, "plug");
        assert_eq!(mgr.on_ready(session_id), ReadyAckStatus::Ok);
        assert_eq!(mgr.on_ready(session_id), ReadyAckStatus::NotReady);
    }

    #[test]
    fn version_mismatch_rejected_before_allocating_a_session() {
        let (mgr, _clock) = manager_with_fake_clock();
        let (status, session_id) = mgr.on_hello(999, 1, "plug");
        assert_eq!(status, WelcomeStatus::VersionMismatch);
        assert_eq!(session_id, 0);
    }

    #[test]
    fn empty_plugin_name_rejected() {
        let (mgr, _clock) = manager_with_fake_clock();
        let (status, _) = mgr.on_hello(crate::handshake::CURRENT_PROTOCOL_VERSION, 1, "");
        assert_eq!(status, WelcomeStatus::InvalidName);
    }

    #[test]
    fn heartbeat_timeout_disconnects_and_unregisters_objects() {
        let (mgr, clock) = manager_with_fake_clock();
        let (_, session_id) = mgr.on_hello(crate::handshake::CURRENT_PROTOCOL_VERSION, 1, "plug");
        mgr.on_ready(session_id);

        clock.now.store(HEARTBEAT_TIMEOUT_MS + 500, Ordering::SeqCst);
        let timed_out = mgr.scan_timeouts();
        assert_eq!(timed_out, vec![session_id]);
        assert!(!mgr.is_alive(session_id));
        assert!(!mgr.sessions.is_allocated(session_id));
    }

    #[test]
    fn heartbeat_resets_the_timeout_clock() {
        let (mgr, clock) = manager_with_fake_clock();
        let (_, session_id) = mgr.on_hello(crate::handshake::CURRENT_PROTOCOL_VERSION, 1, "plug");
        mgr.on_ready(session_id);

        clock.now.store(HEARTBEAT_TIMEOUT_MS - 100, Ordering::SeqCst);
        mgr.on_heartbeat(session_id).unwrap();

        clock.now.store(HEARTBEAT_TIMEOUT_MS - 100 + HEARTBEAT_TIMEOUT_MS - 100, Ordering::SeqCst);
        assert!(mgr.scan_timeouts().is_empty());
        assert!(mgr.is_alive(session_id));
    }

    #[test]
    fn disconnect_unregisters_registry_entries_for_that_session() {
        let (mgr, _clock) = manager_with_fake_clock();
        let (_, session_id) = mgr.on_hello(crate::handshake::CURRENT_PROTOCOL_VERSION, 1, "plug");
        mgr.on_ready(session_id);

        let iid = crate::object_id::Guid::new(1, 2, 3, [0; 8]);
        mgr.registry
            .register(
                crate::object_id::ObjectId::new(session_id, 1, 1),
                iid,
                None,
                session_id,
                "Feature",
                1,
            )
            .unwrap();

        mgr.disconnect(session_id);
        assert!(mgr.registry.lookup_by_name("Feature").is_none());
    }
}
