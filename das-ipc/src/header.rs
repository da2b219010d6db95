//! Component B — Message Header & Framing.
//!
//! Fixed, little-endian, 8-byte-aligned V2 header. `serialize_header` and
//! `parse_header` are the only place in the crate that know this exact byte
//! layout; everything above (run-loop, router, proxy/stub) works with the
//! [`MessageHeader`] struct.

use crate::object_id::ObjectId;

pub const MAGIC: u32 = 0x4441_5349; // "DASI"
pub const PROTOCOL_VERSION: u16 = 1;

/// Header size on the wire, in bytes. Matches §3.4 field-by-field:
/// magic(4) + version(2) + flags(2) + call_id(8) + message_type(1) + _pad(3)
/// + error_code(4) + interface_id(4) + method_id(4) + session_id(2)
/// + generation(2) + local_id(4) + body_size(4) = 44.
pub const HEADER_SIZE: usize = 44;

/// Bit 0 of `flags`: body is a single u64 SHM handle, not inline bytes.
pub const FLAG_LARGE_MESSAGE: u16 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Event = 2,
    Heartbeat = 3,
}

impl MessageType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Event),
            3 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// Control-plane `interface_id` discriminators (§4.I).
pub mod control_plane {
    pub const HELLO_OR_WELCOME: u32 = 1;
    pub const READY: u32 = 2;
    pub const HEARTBEAT: u32 = 3;
    pub const GOODBYE: u32 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub flags: u16,
    pub call_id: u64,
    pub message_type: MessageType,
    pub error_code: i32,
    pub interface_id: u32,
    pub method_id: u32,
    pub session_id: u16,
    pub generation: u16,
    pub local_id: u32,
    pub body_size: u32,
}

impl MessageHeader {
    /// Build a header targeting `object`, leaving `error_code = 0` and no
    /// large-message flag — callers adjust those as needed.
    pub fn for_object(
        call_id: u64,
        message_type: MessageType,
        interface_id: u32,
        method_id: u32,
        object: ObjectId,
        body_size: u32,
    ) -> Self {
        Self {
            flags: 0,
            call_id,
            message_type,
            error_code: 0,
            interface_id,
            method_id,
            session_id: object.session_id,
            generation: object.generation,
            local_id: object.local_id,
            body_size,
        }
    }

    pub fn target_object(&self) -> ObjectId {
        ObjectId::new(self.session_id, self.generation, self.local_id)
    }

    pub fn is_large_message(&self) -> bool {
        self.flags & FLAG_LARGE_MESSAGE != 0
    }

    pub fn set_large_message(&mut self, large: bool) {
        if large {
            self.flags |= FLAG_LARGE_MESSAGE;
        } else {
            self.flags &= !FLAG_LARGE_MESSAGE;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("bad magic")]
    BadMagic,
    #[error("bad protocol version")]
    BadVersion,
    #[error("truncated header")]
    Truncated,
}

/// Write the exact V2 header layout of §3.4 into `out`.
pub fn serialize_header(header: &MessageHeader, out: &mut Vec<u8>) {
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    out.extend_from_slice(&header.flags.to_le_bytes());
    out.extend_from_slice(&header.call_id.to_le_bytes());
    out.push(header.message_type as u8);
    out.extend_from_slice(&[0u8; 3]); // _pad
    out.extend_from_slice(&header.error_code.to_le_bytes());
    out.extend_from_slice(&header.interface_id.to_le_bytes());
    out.extend_from_slice(&header.method_id.to_le_bytes());
    out.extend_from_slice(&header.session_id.to_le_bytes());
    out.extend_from_slice(&header.generation.to_le_bytes());
    out.extend_from_slice(&header.local_id.to_le_bytes());
    out.extend_from_slice(&header.body_size.to_le_bytes());
}

/// Parse a header from the front of `input`, rejecting unexpected magic or
/// version. Does not validate `body_size` against a transport limit — that
/// is the transport's job, since only it knows the negotiated max.
pub fn parse_header(input: &[u8]) -> Result<MessageHeader, HeaderError> {
    if input.len() < HEADER_SIZE {
        return Err(HeaderError::Truncated);
    }
    let magic = u32::from_le_bytes(input[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(HeaderError::BadMagic);
    }
    let version = u16::from_le_bytes(input[4..6].try_into().unwrap());
    if version != PROTOCOL_VERSION {
        return Err(HeaderError::BadVersion);
    }
    let flags = u16::from_le_bytes(input[6..8].try_into().unwrap());
    let call_id = u64::from_le_bytes(input[8..16].try_into().unwrap());
    let message_type =
        MessageType::from_u8(input[16]).ok_or(HeaderError::Truncated)?;
    // input[17..20] is _pad
    let error_code = i32::from_le_bytes(input[20..24].try_into().unwrap());
    let interface_id = u32::from_le_bytes(input[24..28].try_into().unwrap());
    let method_id = u32::from_le_bytes(input[28..32].try_into().unwrap());
    let session_id = u16::from_le_bytes(input[32..34].try_into().unwrap());
    let generation = u16::from_le_bytes(input[34..36].try_into().unwrap());
    let local_id = u32::from_le_bytes(input[36..40].try_into().unwrap());
    let body_size = u32::from_le_bytes(input[40..44].try_into().unwrap());
    Ok(MessageHeader {
        flags,
        call_id,
        message_type,
        error_code,
        interface_id,
        method_id,
        session_id,
        generation,
        local_id,
        body_size,
    })
}
