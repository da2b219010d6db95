//! Component I (wire formats) — Handshake control-plane messages.
//!
//! Every struct here is fixed-layout, little-endian, and 8-byte aligned per
//! SPEC_FULL.md §4.I. These are carried as the *body* of a control-plane
//! frame whose header uses `object_id = 0`, `method_id = 0`, and one of the
//! `interface_id` discriminators in [`crate::header::control_plane`].

use crate::error::{IpcError, Result};
use crate::serializer::{Reader, Writer};

pub const CURRENT_PROTOCOL_VERSION: u32 = 1;
pub const PLUGIN_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloRequest {
    pub protocol_version: u32,
    pub pid: u32,
    pub plugin_name: String,
}

impl HelloRequest {
    pub fn new(pid: u32, plugin_name: impl Into<String>) -> Self {
        Self {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            pid,
            plugin_name: plugin_name.into(),
        }
    }

    /// Fixed layout: `protocol_version:u32 | pid:u32 | plugin_name:char[64]`.
    /// The name field is a raw NUL-terminated block, not length-prefixed —
    /// it does not use the serializer's `write_string` framing.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + PLUGIN_NAME_LEN);
        out.extend_from_slice(&self.protocol_version.to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        let mut name_buf = [0u8; PLUGIN_NAME_LEN];
        let bytes = self.plugin_name.as_bytes();
        let n = bytes.len().min(PLUGIN_NAME_LEN - 1);
        name_buf[..n].copy_from_slice(&bytes[..n]);
        out.extend_from_slice(&name_buf);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 8 + PLUGIN_NAME_LEN {
            return Err(IpcError::DeserializationFailed);
        }
        let mut r = Reader::new(body);
        let protocol_version = r.read_u32()?;
        let pid = r.read_u32()?;
        let name_bytes = &body[8..8 + PLUGIN_NAME_LEN];
        let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(PLUGIN_NAME_LEN);
        let plugin_name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();
        Ok(Self {
            protocol_version,
            pid,
            plugin_name,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WelcomeStatus {
    Ok,
    VersionMismatch,
    TooManyClients,
    InvalidName,
}

impl WelcomeStatus {
    fn to_u32(self) -> u32 {
        match self {
            WelcomeStatus::Ok => 0,
            WelcomeStatus::VersionMismatch => 1,
            WelcomeStatus::TooManyClients => 2,
            WelcomeStatus::InvalidName => 3,
        }
    }

    fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => WelcomeStatus::Ok,
            1 => WelcomeStatus::VersionMismatch,
            2 => WelcomeStatus::TooManyClients,
            3 => WelcomeStatus::InvalidName,
            _ => return Err(IpcError::DeserializationFailed),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WelcomeResponse {
    pub session_id: u16,
    pub status: WelcomeStatus,
}

impl WelcomeResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u16(self.session_id);
        w.write_u16(0); // _rsvd
        w.write_u32(self.status.to_u32());
        w.into_bytes()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let session_id = r.read_u16()?;
        let _rsvd = r.read_u16()?;
        let status = WelcomeStatus::from_u32(r.read_u32()?)?;
        Ok(Self { session_id, status })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyRequest {
    pub session_id: u16,
}

impl ReadyRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u16(self.session_id);
        w.write_u16(0);
        w.into_bytes()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let session_id = r.read_u16()?;
        let _rsvd = r.read_u16()?;
        Ok(Self { session_id })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyAckStatus {
    Ok,
    InvalidSession,
    NotReady,
}

impl ReadyAckStatus {
    fn to_u32(self) -> u32 {
        match self {
            ReadyAckStatus::Ok => 0,
            ReadyAckStatus::InvalidSession => 1,
            ReadyAckStatus::NotReady => 2,
        }
    }

    fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => ReadyAckStatus::Ok,
            1 => ReadyAckStatus::InvalidSession,
            2 => ReadyAckStatus::NotReady,
            _ => return Err(IpcError::DeserializationFailed),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyAck {
    pub status: ReadyAckStatus,
}

impl ReadyAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32(self.status.to_u32());
        w.into_bytes()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let status = ReadyAckStatus::from_u32(r.read_u32()?)?;
        Ok(Self { status })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub timestamp_ms: u64,
}

impl Heartbeat {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u64(self.timestamp_ms);
        w.into_bytes()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        Ok(Self {
            timestamp_ms: r.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoodbyeReason {
    Normal,
    HeartbeatTimeout,
    ProtocolError,
    Resources,
    RequestedByPeer,
}

impl GoodbyeReason {
    fn to_u32(self) -> u32 {
        match self {
            GoodbyeReason::Normal => 0,
            GoodbyeReason::HeartbeatTimeout => 1,
            GoodbyeReason::ProtocolError => 2,
            GoodbyeReason::Resources => 3,
            GoodbyeReason::RequestedByPeer => 4,
        }
    }

    fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => GoodbyeReason::Normal,
            1 => GoodbyeReason::HeartbeatTimeout,
            2 => GoodbyeReason::ProtocolError,
            3 => GoodbyeReason::Resources,
            4 => GoodbyeReason::RequestedByPeer,
            _ => return Err(IpcError::DeserializationFailed),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Goodbye {
    pub reason: GoodbyeReason,
}

impl Goodbye {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32(self.reason.to_u32());
        w.write_u32(0); // _rsvd
        w.into_bytes()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let reason = GoodbyeReason::from_u32(r.read_u32()?)?;
        let _rsvd = r.read_u32()?;
        Ok(Self { reason })
    }
}

/// Child-side handshake state machine (§3.6): strictly
/// `Disconnected -> HelloSent -> WelcomeRecv -> ReadySent -> Connected`,
/// with an explicit `Failed` sink on any out-of-order or erroneous reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Disconnected,
    HelloSent,
    WelcomeRecv,
    ReadySent,
    Connected,
    Failed,
}

/// Drives the child side of the handshake. A fresh instance starts
/// `Disconnected`; a retry restarts from a fresh instance, mirroring the
/// source's "restart from Disconnected" retry policy (SPEC_FULL.md §4.I).
#[derive(Debug)]
pub struct ChildHandshake {
    state: ChildState,
    session_id: u16,
}

impl Default for ChildHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ChildHandshake {
    pub fn new() -> Self {
        Self {
            state: ChildState::Disconnected,
            session_id: 0,
        }
    }

    pub fn state(&self) -> ChildState {
        self.state
    }

    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    pub fn send_hello(&mut self, pid: u32, plugin_name: impl Into<String>) -> HelloRequest {
        self.state = ChildState::HelloSent;
        HelloRequest::new(pid, plugin_name)
    }

    pub fn on_welcome(&mut self, response: &WelcomeResponse) -> Result<()> {
        if self.state != ChildState::HelloSent {
            self.state = ChildState::Failed;
            return Err(IpcError::InvalidState);
        }
        if response.status != WelcomeStatus::Ok || response.session_id == 0 {
            self.state = ChildState::Failed;
            return Err(IpcError::HandshakeFailed);
        }
        self.session_id = response.session_id;
        self.state = ChildState::WelcomeRecv;
        Ok(())
    }

    pub fn send_ready(&mut self) -> Result<ReadyRequest> {
        if self.state != ChildState::WelcomeRecv {
            self.state = ChildState::Failed;
            return Err(IpcError::InvalidState);
        }
        self.state = ChildState::ReadySent;
        Ok(ReadyRequest {
            session_id: self.session_id,
        })
    }

    pub fn on_ready_ack(&mut self, ack: &ReadyAck) -> Result<()> {
        if self.state != ChildState::ReadySent {
            self.state = ChildState::Failed;
            return Err(IpcError::InvalidState);
        }
        if ack.status != ReadyAckStatus::Ok {
            self.state = ChildState::Failed;
            return Err(IpcError::HandshakeFailed);
        }
        self.state = ChildState::Connected;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.state = ChildState::Disconnected;
        self.session_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_request_round_trips_including_long_name_truncation() {
        let req = HelloRequest::new(1234, "x".repeat(100));
        let body = req.encode();
        assert_eq!(body.len(), 8 + PLUGIN_NAME_LEN);
        let decoded = HelloRequest::decode(&body).unwrap();
        assert_eq!(decoded.protocol_version, CURRENT_PROTOCOL_VERSION);
        assert_eq!(decoded.pid, 1234);
        assert_eq!(decoded.plugin_name.len(), PLUGIN_NAME_LEN - 1);
    }

    #[test]
    fn hello_request_round_trips_short_name() {
        let req = HelloRequest::new(42, "plug");
        let body = req.encode();
        let decoded = HelloRequest::decode(&body).unwrap();
        assert_eq!(decoded.pid, 42);
        assert_eq!(decoded.plugin_name, "plug");
    }

    #[test]
    fn welcome_response_round_trips() {
        let resp = WelcomeResponse {
            session_id: 7,
            status: WelcomeStatus::Ok,
        };
        let decoded = WelcomeResponse::decode(&resp.encode()).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn child_happy_path_reaches_connected() {
        let mut child = ChildHandshake::new();
        let _hello = child.send_hello(1, "plug");
        assert_eq!(child.state(), ChildState::HelloSent);

        child
            .on_welcome(&WelcomeResponse {
                session_id: 5,
                status: WelcomeStatus::Ok,
            })
            .unwrap();
        assert_eq!(child.state(), ChildState::WelcomeRecv);
        assert_eq!(child.session_id(), 5);

        let ready = child.send_ready().unwrap();
        assert_eq!(ready.session_id, 5);
        assert_eq!(child.state(), ChildState::ReadySent);

        child
            .on_ready_ack(&ReadyAck {
                status: ReadyAckStatus::Ok,
            })
            .unwrap();
        assert_eq!(child.state(), ChildState::Connected);
    }

    #[test]
    fn child_out_of_order_reply_fails() {
        let mut child = ChildHandshake::new();
        let result = child.on_welcome(&WelcomeResponse {
            session_id: 5,
            status: WelcomeStatus::Ok,
        });
        assert_eq!(result, Err(IpcError::InvalidState));
        assert_eq!(child.state(), ChildState::Failed);
    }

    #[test]
    fn child_version_mismatch_status_fails_handshake() {
        let mut child = ChildHandshake::new();
        child.send_hello(1, "plug");
        let result = child.on_welcome(&WelcomeResponse {
            session_id: 0,
            status: WelcomeStatus::VersionMismatch,
        });
        assert_eq!(result, Err(IpcError::HandshakeFailed));
        assert_eq!(child.state(), ChildState::Failed);
    }
}
