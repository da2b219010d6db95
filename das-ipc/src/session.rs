//! Component H — Session Coordinator.
//!
//! Process-wide allocator for `u16` session ids. `0` (null), `1` (host), and
//! `0xFFFF` (broadcast/invalid) are reserved and never handed out. This is
//! the *only* session-id allocator in the process — the Handshake &
//! Connection Manager (§4.I) calls through here instead of keeping a private
//! counter (SPEC_FULL.md §9 deviation notes).

use std::sync::atomic::{AtomicU16, Ordering};

use parking_lot::Mutex;

use crate::error::{IpcError, Result};

pub const SESSION_NULL: u16 = 0;
pub const SESSION_HOST: u16 = 1;
pub const SESSION_BROADCAST: u16 = 0xFFFF;

fn is_reserved(id: u16) -> bool {
    matches!(id, SESSION_NULL | SESSION_HOST | SESSION_BROADCAST)
}

struct Allocated {
    ids: std::collections::HashSet<u16>,
}

/// Thread-safe session id allocator (§4.H). A single mutex guards the
/// allocation set; the local-session-id slot is a plain atomic since it is
/// set once at startup and read often.
pub struct SessionCoordinator {
    allocated: Mutex<Allocated>,
    cursor: AtomicU16,
    local_session_id: AtomicU16,
}

impl Default for SessionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCoordinator {
    pub fn new() -> Self {
        Self {
            allocated: Mutex::new(Allocated {
                ids: std::collections::HashSet::new(),
            }),
            cursor: AtomicU16::new(2),
            local_session_id: AtomicU16::new(SESSION_NULL),
        }
    }

    pub fn is_valid(id: u16) -> bool {
        !is_reserved(id)
    }

    pub fn is_allocated(&self, id: u16) -> bool {
        self.allocated.lock().ids.contains(&id)
    }

    /// Allocate the next free non-reserved id, rotating from an internal
    /// cursor so ids are reused only once they have cycled all the way
    /// around the `u16` space.
    pub fn allocate(&self) -> Result<u16> {
        let mut allocated = self.allocated.lock();
        let start = self.cursor.load(Ordering::Relaxed);
        let mut candidate = start;
        loop {
            if !is_reserved(candidate) && !allocated.ids.contains(&candidate) {
                allocated.ids.insert(candidate);
                let next = candidate.wrapping_add(1);
                self.cursor.store(if next == 0 { 2 } else { next }, Ordering::Relaxed);
                return Ok(candidate);
            }
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                candidate = 2;
            }
            if candidate == start {
                return Err(IpcError::ConnectionLimitReached);
            }
        }
    }

    pub fn release(&self, id: u16) {
        if is_reserved(id) {
            return;
        }
        self.allocated.lock().ids.remove(&id);
    }

    pub fn set_local(&self, id: u16) -> Result<()> {
        if is_reserved(id) && id != SESSION_HOST {
            return Err(IpcError::InvalidArgument);
        }
        self.local_session_id.store(id, Ordering::Relaxed);
        Ok(())
    }

    pub fn get_local(&self) -> u16 {
        self.local_session_id.load(Ordering::Relaxed)
    }
}
