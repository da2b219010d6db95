//! Component D — Message Queue Transport.
//!
//! A transport is a pair of named queues, one per direction. `send`/`receive`
//! pick the inline path or the shared-memory escape based on `max_message_size`.
//! Two implementations are provided: [`mq::PosixMqTransport`] (real POSIX
//! message queues, Unix only) and [`loopback::LoopbackTransport`] (an
//! in-process channel pair satisfying the same contract, used throughout this
//! crate's test suite so every component above this one can be exercised
//! without OS resources).

pub mod loopback;
#[cfg(unix)]
pub mod mq;

use std::sync::Arc;
use std::time::Duration;

use crate::error::{IpcError, Result};
use crate::header::{self, MessageHeader, HEADER_SIZE};
use crate::shm::SharedMemoryPool;

/// A received frame: header plus body (already resolved out of shared
/// memory, if that path was used).
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: MessageHeader,
    pub body: Vec<u8>,
}

/// Transport-level send/receive contract shared by every backend.
pub trait Transport: Send + Sync {
    /// Raw, un-interpreted send of a single frame. Implementations must pick
    /// the inline-vs-SHM-escape path themselves based on `max_message_size`.
    fn send(&self, header: MessageHeader, body: &[u8]) -> Result<()>;

    /// Block up to `timeout` waiting for the next frame in this direction.
    fn receive(&self, timeout: Duration) -> Result<Frame>;
}

/// Shared send/receive logic common to every backend: decide inline vs SHM,
/// and on receive, resolve an SHM handle back into bytes.
///
/// Concrete transports implement [`RawQueue`] (how to put/get an opaque byte
/// frame on the wire) and get `Transport::send`/`receive` for free via
/// [`FramedTransport`].
pub trait RawQueue: Send + Sync {
    fn send_raw(&self, bytes: &[u8]) -> Result<()>;
    fn receive_raw(&self, timeout: Duration) -> Result<Vec<u8>>;
}

pub struct FramedTransport<Q: RawQueue> {
    queue: Q,
    shm: Option<Arc<SharedMemoryPool>>,
    max_message_size: usize,
}

impl<Q: RawQueue> FramedTransport<Q> {
    pub fn new(queue: Q, shm: Option<Arc<SharedMemoryPool>>, max_message_size: usize) -> Self {
        Self {
            queue,
            shm,
            max_message_size,
        }
    }
}

impl<Q: RawQueue> Transport for FramedTransport<Q> {
    fn send(&self, mut header: MessageHeader, body: &[u8]) -> Result<()> {
        let inline_size = HEADER_SIZE + body.len();
        if inline_size <= self.max_message_size {
            header.set_large_message(false);
            header.body_size = body.len() as u32;
            let mut out = Vec::with_capacity(inline_size);
            header::serialize_header(&header, &mut out);
            out.extend_from_slice(body);
            self.queue.send_raw(&out)
        } else {
            let shm = self
                .shm
                .as_ref()
                .ok_or(IpcError::SharedMemoryFailed("no pool attached".into()))?;
            let handle = shm.write(body)?;
            header.set_large_message(true);
            header.body_size = 8;
            let mut out = Vec::with_capacity(HEADER_SIZE + 8);
            header::serialize_header(&header, &mut out);
            out.extend_from_slice(&handle.to_le_bytes());
            self.queue.send_raw(&out)
        }
    }

    fn receive(&self, timeout: Duration) -> Result<Frame> {
        let raw = self.queue.receive_raw(timeout)?;
        let parsed = header::parse_header(&raw).map_err(|_| IpcError::InvalidMessageHeader)?;
        let body_start = HEADER_SIZE;

        if parsed.is_large_message() {
            if parsed.body_size != 8 {
                return Err(IpcError::InvalidMessageHeader);
            }
            let handle_bytes: [u8; 8] = raw
                .get(body_start..body_start + 8)
                .ok_or(IpcError::InvalidMessage)?
                .try_into()
                .map_err(|_| IpcError::InvalidMessage)?;
            let handle = u64::from_le_bytes(handle_bytes);
            let shm = self
                .shm
                .as_ref()
                .ok_or(IpcError::SharedMemoryFailed("no pool attached".into()))?;
            let body = shm.read(handle)?;
            shm.deallocate(handle)?;
            Ok(Frame {
                header: parsed,
                body,
            })
        } else {
            let body = raw
                .get(body_start..body_start + parsed.body_size as usize)
                .ok_or(IpcError::InvalidMessage)?
                .to_vec();
            Ok(Frame {
                header: parsed,
                body,
            })
        }
    }
}

/// Message-queue name template per §6.2: `"<prefix>_<host_pid>_<peer_pid>_<h2p|p2h>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToPeer,
    PeerToHost,
}

pub fn make_queue_name(prefix: &str, host_pid: u32, peer_pid: u32, direction: Direction) -> String {
    let suffix = match direction {
        Direction::HostToPeer => "h2p",
        Direction::PeerToHost => "p2h",
    };
    format!("{prefix}_{host_pid}_{peer_pid}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_name_template_matches_spec() {
        assert_eq!(
            make_queue_name("das_ipc", 100, 200, Direction::HostToPeer),
            "das_ipc_100_200_h2p"
        );
        assert_eq!(
            make_queue_name("das_ipc", 100, 200, Direction::PeerToHost),
            "das_ipc_100_200_p2h"
        );
    }
}
