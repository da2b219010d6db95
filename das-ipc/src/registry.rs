//! Component G — Remote Object Registry.
//!
//! Publishes objects by `(ObjectId, interface_id, name)` and keeps three
//! indices mutually consistent under every mutation (§3.3, §4.G).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{IpcError, Result};
use crate::object_id::{Guid, ObjectId};

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a over the 16 wire-order bytes of `iid` (§3.3). Must be
/// bit-for-bit identical across every implementation of this protocol.
pub fn compute_interface_id(iid: Guid) -> u32 {
    let mut hash = FNV_OFFSET;
    for byte in iid.to_bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Clone)]
pub struct RemoteObjectInfo {
    pub iid: Guid,
    pub interface_id: u32,
    pub object_id: ObjectId,
    pub session_id: u16,
    pub name: String,
    pub version: u16,
}

#[derive(Default)]
struct Indices {
    by_object_id: HashMap<ObjectId, RemoteObjectInfo>,
    by_name: HashMap<String, ObjectId>,
    by_interface_id: HashMap<u32, Vec<ObjectId>>,
}

/// Three-index registry, single mutex guarding all mutations (§5).
#[derive(Default)]
pub struct RemoteObjectRegistry {
    indices: Mutex<Indices>,
}

impl RemoteObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        object_id: ObjectId,
        iid: Guid,
        interface_id: Option<u32>,
        session_id: u16,
        name: impl Into<String>,
        version: u16,
    ) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(IpcError::InvalidArgument);
        }
        let interface_id = interface_id.unwrap_or_else(|| compute_interface_id(iid));

        let mut indices = self.indices.lock();
        if indices.by_object_id.contains_key(&object_id) {
            return Err(IpcError::DuplicateElement);
        }
        if indices.by_name.contains_key(&name) {
            return Err(IpcError::DuplicateElement);
        }

        let info = RemoteObjectInfo {
            iid,
            interface_id,
            object_id,
            session_id,
            name: name.clone(),
            version,
        };
        indices.by_object_id.insert(object_id, info);
        indices.by_name.insert(name, object_id);
        indices
            .by_interface_id
            .entry(interface_id)
            .or_default()
            .push(object_id);
        Ok(())
    }

    pub fn unregister(&self, object_id: ObjectId) -> Result<()> {
        let mut indices = self.indices.lock();
        let info = indices
            .by_object_id
            .remove(&object_id)
            .ok_or(IpcError::ObjectNotFound)?;
        indices.by_name.remove(&info.name);
        if let Some(list) = indices.by_interface_id.get_mut(&info.interface_id) {
            list.retain(|id| *id != object_id);
            if list.is_empty() {
                indices.by_interface_id.remove(&info.interface_id);
            }
        }
        Ok(())
    }

    /// Remove every entry belonging to `session_id`, e.g. on peer disconnect.
    pub fn unregister_all_from_session(&self, session_id: u16) {
        let victims: Vec<ObjectId> = {
            let indices = self.indices.lock();
            indices
                .by_object_id
                .values()
                .filter(|info| info.session_id == session_id)
                .map(|info| info.object_id)
                .collect()
        };
        for object_id in victims {
            let _ = self.unregister(object_id);
        }
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<RemoteObjectInfo> {
        let indices = self.indices.lock();
        let id = indices.by_name.get(name)?;
        indices.by_object_id.get(id).cloned()
    }

    pub fn lookup_by_interface(&self, interface_id: u32) -> Vec<RemoteObjectInfo> {
        let indices = self.indices.lock();
        indices
            .by_interface_id
            .get(&interface_id)
            .into_iter()
            .flatten()
            .filter_map(|id| indices.by_object_id.get(id).cloned())
            .collect()
    }

    pub fn get_info(&self, object_id: ObjectId) -> Option<RemoteObjectInfo> {
        self.indices.lock().by_object_id.get(&object_id).cloned()
    }

    pub fn list_all(&self) -> Vec<RemoteObjectInfo> {
        self.indices.lock().by_object_id.values().cloned().collect()
    }

    pub fn list_by_session(&self, session_id: u16) -> Vec<RemoteObjectInfo> {
        self.indices
            .lock()
            .by_object_id
            .values()
            .filter(|info| info.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn object_exists(&self, object_id: ObjectId) -> bool {
        self.indices.lock().by_object_id.contains_key(&object_id)
    }

    pub fn count(&self) -> usize {
        self.indices.lock().by_object_id.len()
    }

    pub fn clear(&self) {
        let mut indices = self.indices.lock();
        indices.by_object_id.clear();
        indices.by_name.clear();
        indices.by_interface_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_guid() -> Guid {
        Guid::new(0x1234_5678, 0x1234, 0x5678, [0x90, 0xAB, 0xCD, 0xEF, 0x01, 0x23, 0x45, 0x67])
    }

    #[test]
    fn fnv1a_is_deterministic() {
        let a = compute_interface_id(sample_guid());
        let b = compute_interface_id(sample_guid());
        assert_eq!(a, b);
    }

    #[test]
    fn register_then_lookup_every_index() {
        let reg = RemoteObjectRegistry::new();
        let id = ObjectId::new(1, 1, 1);
        reg.register(id, sample_guid(), None, 1, "TestObject", 1).unwrap();

        assert!(reg.object_exists(id));
        assert_eq!(reg.lookup_by_name("TestObject").unwrap().object_id, id);
        let iid = compute_interface_id(sample_guid());
        assert_eq!(reg.lookup_by_interface(iid).len(), 1);
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn duplicate_object_id_or_name_rejected() {
        let reg = RemoteObjectRegistry::new();
        let id = ObjectId::new(1, 1, 1);
        reg.register(id, sample_guid(), None, 1, "A", 1).unwrap();

        assert_eq!(
            reg.register(id, sample_guid(), None, 1, "B", 1),
            Err(IpcError::DuplicateElement)
        );
        let id2 = ObjectId::new(1, 1, 2);
        assert_eq!(
            reg.register(id2, sample_guid(), None, 1, "A", 1),
            Err(IpcError::DuplicateElement)
        );
    }

    #[test]
    fn empty_name_rejected() {
        let reg = RemoteObjectRegistry::new();
        assert_eq!(
            reg.register(ObjectId::new(1, 1, 1), sample_guid(), None, 1, "", 1),
            Err(IpcError::InvalidArgument)
        );
    }

    #[test]
    fn indices_stay_consistent_after_unregister() {
        let reg = RemoteObjectRegistry::new();
        let id = ObjectId::new(1, 1, 1);
        reg.register(id, sample_guid(), None, 1, "A", 1).unwrap();
        reg.unregister(id).unwrap();

        assert!(!reg.object_exists(id));
        assert!(reg.lookup_by_name("A").is_none());
        let iid = compute_interface_id(sample_guid());
        assert!(reg.lookup_by_interface(iid).is_empty());
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn unregister_all_from_session_clears_only_that_session() {
        let reg = RemoteObjectRegistry::new();
        reg.register(ObjectId::new(5, 1, 1), sample_guid(), None, 5, "A", 1).unwrap();
        reg.register(ObjectId::new(6, 1, 1), sample_guid(), None, 6, "B", 1).unwrap();

        reg.unregister_all_from_session(5);
        assert_eq!(reg.count(), 1);
        assert!(reg.lookup_by_name("B").is_some());
        assert!(reg.lookup_by_name("A").is_none());
    }
}
