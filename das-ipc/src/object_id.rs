//! Component A — Object Identity.
//!
//! A 64-bit, cross-process stable handle: `(session_id, generation, local_id)`.
//! Packing is total and bijective; the zero value is reserved for "null".

/// Cross-process object handle.
///
/// `session_id` occupies the most significant 16 bits of the encoded form,
/// then `generation`, then `local_id` in the least significant 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ObjectId {
    pub session_id: u16,
    pub generation: u16,
    pub local_id: u32,
}

impl ObjectId {
    pub const NULL: ObjectId = ObjectId {
        session_id: 0,
        generation: 0,
        local_id: 0,
    };

    pub fn new(session_id: u16, generation: u16, local_id: u32) -> Self {
        Self {
            session_id,
            generation,
            local_id,
        }
    }

    /// Encode as a single little-endian 64-bit integer.
    ///
    /// Layout (high to low bits): `session_id:16 | generation:16 | local_id:32`.
    pub fn encode(self) -> u64 {
        (self.session_id as u64) << 48 | (self.generation as u64) << 32 | self.local_id as u64
    }

    /// Decode from the 64-bit form produced by [`ObjectId::encode`].
    pub fn decode(value: u64) -> Self {
        Self {
            session_id: (value >> 48) as u16,
            generation: (value >> 32) as u16,
            local_id: value as u32,
        }
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl From<ObjectId> for u64 {
    fn from(id: ObjectId) -> u64 {
        id.encode()
    }
}

impl From<u64> for ObjectId {
    fn from(v: u64) -> ObjectId {
        ObjectId::decode(v)
    }
}

/// Bump a generation counter, wrapping to `1` (never `0`, which is reserved
/// for "not yet assigned") on `u16` overflow.
pub fn increment_generation(current: u16) -> u16 {
    match current.checked_add(1) {
        Some(0) | None => 1,
        Some(next) => next,
    }
}

/// A 128-bit interface type id, stored in the same field layout as a
/// Windows-style GUID: `data1` (u32), `data2` (u16), `data3` (u16), `data4`
/// (8 raw bytes). This layout is load-bearing — it is exactly what
/// [`crate::registry::compute_interface_id`] hashes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    /// Bytes in wire order: `data1` LE, `data2` LE, `data3` LE, then `data4` verbatim.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..16].copy_from_slice(&self.data4);
        out
    }
}
