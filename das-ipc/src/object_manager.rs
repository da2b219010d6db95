//! Component F — Object Manager.
//!
//! Per-process table of local and remote object references. A single
//! reader-writer lock guards the table so `lookup`/`is_valid`/`is_local` can
//! proceed concurrently, while mutators (`register_*`, `add_ref`, `release`,
//! `unregister`) take the table exclusively (§5).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{IpcError, Result};
use crate::object_id::{increment_generation, ObjectId};

/// Result of [`ObjectManager::lookup`].
#[derive(Clone)]
pub enum LookupResult {
    /// Local object, resolvable to the pointer passed at registration.
    Local(Arc<dyn Any + Send + Sync>),
    /// The entry exists but is a remote-object tombstone, not a local object.
    NotLocal,
    /// No entry for this `local_id` at all.
    NotFound,
    /// An entry exists for this `local_id` but its generation has moved on.
    Stale,
}

// Manual impl: `Arc<dyn Any + Send + Sync>` doesn't implement `Debug`, so
// `Local`'s payload is represented by its variant name only.
impl std::fmt::Debug for LookupResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(_) => f.write_str("Local(..)"),
            Self::NotLocal => f.write_str("NotLocal"),
            Self::NotFound => f.write_str("NotFound"),
            Self::Stale => f.write_str("Stale"),
        }
    }
}

struct Entry {
    refcount: u32,
    is_local: bool,
    generation: u16,
    ptr: Option<Arc<dyn Any + Send + Sync>>,
}

/// `local_id` is only *per-owner* unique (§3.1) — the table holds local
/// **and** remote entries side by side (§3.2), so every key must carry the
/// owning `session_id` too, or a remote tombstone and a local object that
/// happen to share a `local_id` would clobber each other.
type ObjectKey = (u16, u32);

struct Table {
    local_session_id: u16,
    next_local_id: u32,
    /// Current generation for every `(session_id, local_id)` ever
    /// allocated, kept even after the entry is removed so a later stale
    /// lookup can still tell "stale" from "never existed".
    generations: HashMap<ObjectKey, u16>,
    entries: HashMap<ObjectKey, Entry>,
}

/// Per-process table of object references (§3.2, §4.F).
pub struct ObjectManager {
    table: RwLock<Table>,
}

impl ObjectManager {
    pub fn new(local_session_id: u16) -> Self {
        Self {
            table: RwLock::new(Table {
                local_session_id,
                next_local_id: 1,
                generations: HashMap::new(),
                entries: HashMap::new(),
            }),
        }
    }

    pub fn local_session_id(&self) -> u16 {
        self.table.read().local_session_id
    }

    /// Register a locally-owned object, allocating a fresh `local_id`.
    pub fn register_local(&self, ptr: Arc<dyn Any + Send + Sync>) -> ObjectId {
        let mut table = self.table.write();
        let local_id = table.next_local_id;
        table.next_local_id += 1;
        let key = (table.local_session_id, local_id);
        let generation = *table.generations.entry(key).or_insert(1);
        table.entries.insert(
            key,
            Entry {
                refcount: 1,
                is_local: true,
                generation,
                ptr: Some(ptr),
            },
        );
        ObjectId::new(table.local_session_id, generation, local_id)
    }

    /// Register a tombstone entry for a remote object, used on the proxy
    /// side purely for refcount bookkeeping.
    pub fn register_remote(&self, id: ObjectId) -> Result<()> {
        if id.is_null() {
            return Err(IpcError::InvalidObjectId);
        }
        let mut table = self.table.write();
        let key = (id.session_id, id.local_id);
        table.generations.entry(key).or_insert(id.generation);
        table.entries.insert(
            key,
            Entry {
                refcount: 1,
                is_local: false,
                generation: id.generation,
                ptr: None,
            },
        );
        Ok(())
    }

    /// Remove the entry and, for local objects, bump the generation so any
    /// later reference to the same `local_id` resolves to `Stale`.
    pub fn unregister(&self, id: ObjectId) {
        let mut table = self.table.write();
        let key = (id.session_id, id.local_id);
        if let Some(entry) = table.entries.remove(&key) {
            if entry.is_local {
                let gen = table.generations.entry(key).or_insert(entry.generation);
                *gen = increment_generation(*gen);
            }
        }
    }

    pub fn add_ref(&self, id: ObjectId) -> Result<u32> {
        let mut table = self.table.write();
        let entry = table
            .entries
            .get_mut(&(id.session_id, id.local_id))
            .ok_or(IpcError::ObjectNotFound)?;
        entry.refcount += 1;
        Ok(entry.refcount)
    }

    /// Decrement the refcount; at zero, unregisters the entry (bumping
    /// generation for local objects).
    pub fn release(&self, id: ObjectId) -> Result<u32> {
        let should_unregister;
        let remaining;
        {
            let mut table = self.table.write();
            let entry = table
                .entries
                .get_mut(&(id.session_id, id.local_id))
                .ok_or(IpcError::ObjectNotFound)?;
            entry.refcount = entry.refcount.saturating_sub(1);
            remaining = entry.refcount;
            should_unregister = remaining == 0;
        }
        if should_unregister {
            self.unregister(id);
        }
        Ok(remaining)
    }

    /// Resolve `id` to its local object, or report why it cannot be resolved.
    pub fn lookup(&self, id: ObjectId) -> LookupResult {
        let table = self.table.read();
        let key = (id.session_id, id.local_id);
        match table.entries.get(&key) {
            Some(entry) => {
                if !entry.is_local {
                    return LookupResult::NotLocal;
                }
                if entry.generation != id.generation {
                    return LookupResult::Stale;
                }
                match &entry.ptr {
                    Some(ptr) => LookupResult::Local(ptr.clone()),
                    None => LookupResult::NotLocal,
                }
            }
            None => {
                // A `(session_id, local_id)` we've allocated a generation
                // for before, but whose entry is gone, is Stale only if the
                // session matches and the caller's generation has fallen
                // behind; otherwise it's a genuine not-found.
                if id.session_id == table.local_session_id {
                    if let Some(&current_gen) = table.generations.get(&key) {
                        if current_gen != id.generation {
                            return LookupResult::Stale;
                        }
                    }
                }
                LookupResult::NotFound
            }
        }
    }

    pub fn is_valid(&self, id: ObjectId) -> bool {
        matches!(self.lookup(id), LookupResult::Local(_))
    }

    pub fn is_local(&self, id: ObjectId) -> bool {
        let table = self.table.read();
        table
            .entries
            .get(&(id.session_id, id.local_id))
            .map(|e| e.is_local)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_release_then_stale() {
        let mgr = ObjectManager::new(1);
        let value: Arc<dyn Any + Send + Sync> = Arc::new(42i32);
        let id = mgr.register_local(value.clone());

        match mgr.lookup(id) {
            LookupResult::Local(p) => assert_eq!(*p.downcast_ref::<i32>().unwrap(), 42),
            other => panic!("expected Local, got {other:?}"),
        }
        assert!(mgr.is_valid(id));

        assert_eq!(mgr.release(id).unwrap(), 0);
        assert!(!mgr.is_valid(id));
        assert!(matches!(mgr.lookup(id), LookupResult::Stale));
    }

    #[test]
    fn unknown_local_id_is_not_found() {
        let mgr = ObjectManager::new(1);
        let bogus = ObjectId::new(1, 1, 999);
        assert!(matches!(mgr.lookup(bogus), LookupResult::NotFound));
    }

    #[test]
    fn remote_registration_is_not_local() {
        let mgr = ObjectManager::new(1);
        let remote_id = ObjectId::new(2, 1, 5);
        mgr.register_remote(remote_id).unwrap();
        assert!(matches!(mgr.lookup(remote_id), LookupResult::NotLocal));
        assert!(!mgr.is_local(remote_id));
    }

    #[test]
    fn add_ref_then_two_releases_unregisters() {
        let mgr = ObjectManager::new(1);
        let id = mgr.register_local(Arc::new(7i32));
        assert_eq!(mgr.add_ref(id).unwrap(), 2);
        assert_eq!(mgr.release(id).unwrap(), 1);
        assert!(mgr.is_valid(id));
        assert_eq!(mgr.release(id).unwrap(), 0);
        assert!(!mgr.is_valid(id));
    }

    #[test]
    fn generation_bump_does_not_resurrect_old_local_id_as_different_object() {
        let mgr = ObjectManager::new(1);
        let id1 = mgr.register_local(Arc::new(1i32));
        mgr.release(id1).unwrap();

        // A new registration gets a fresh local_id, not a generation bump of
        // an unrelated object's slot.
        let id2 = mgr.register_local(Arc::new(2i32));
        assert_ne!(id1.local_id, id2.local_id);
        assert!(matches!(mgr.lookup(id1), LookupResult::Stale));
    }
}
