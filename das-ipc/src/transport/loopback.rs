//! In-memory transport satisfying the same contract as the OS-backed one.
//!
//! Used by this crate's own test suite (and available to downstream users)
//! to exercise every layer above the transport without spinning up real
//! POSIX message queues — see SPEC_FULL.md §4.D / testable property 10.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{IpcError, Result};
use crate::shm::SharedMemoryPool;

use super::{FramedTransport, RawQueue, Transport};

pub struct LoopbackQueue {
    tx: Sender<Vec<u8>>,
    rx: Mutex<Receiver<Vec<u8>>>,
}

impl RawQueue for LoopbackQueue {
    fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|e| IpcError::MessageQueueFailed(e.to_string()))
    }

    fn receive_raw(&self, timeout: Duration) -> Result<Vec<u8>> {
        match self.rx.lock().recv_timeout(timeout) {
            Ok(bytes) => Ok(bytes),
            Err(RecvTimeoutError::Timeout) => Err(IpcError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(IpcError::ConnectionLost),
        }
    }
}

/// Build a connected pair of loopback transports: `(host_side, peer_side)`.
/// Whatever `host_side` sends, `peer_side` receives, and vice versa —
/// mirroring the two named queues of a real transport pair.
pub fn pair(
    max_message_size: usize,
    shm: Option<Arc<SharedMemoryPool>>,
) -> (
    FramedTransport<LoopbackQueue>,
    FramedTransport<LoopbackQueue>,
) {
    let (h2p_tx, h2p_rx) = std::sync::mpsc::channel();
    let (p2h_tx, p2h_rx) = std::sync::mpsc::channel();

    let host_side = FramedTransport::new(
        LoopbackQueue {
            tx: h2p_tx,
            rx: Mutex::new(p2h_rx),
        },
        shm.clone(),
        max_message_size,
    );
    let peer_side = FramedTransport::new(
        LoopbackQueue {
            tx: p2h_tx,
            rx: Mutex::new(h2p_rx),
        },
        shm,
        max_message_size,
    );
    (host_side, peer_side)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{MessageHeader, MessageType};
    use crate::object_id::ObjectId;

    #[test]
    fn small_body_round_trips_inline() {
        let (host, peer) = pair(4096, None);
        let header = MessageHeader::for_object(1, MessageType::Request, 7, 1, ObjectId::new(1, 1, 1), 0);
        host.send(header, b"hello").unwrap();
        let frame = peer.receive(Duration::from_millis(100)).unwrap();
        assert_eq!(frame.body, b"hello");
        assert!(!frame.header.is_large_message());
    }

    #[test]
    fn receive_times_out_without_data() {
        let (_host, peer) = pair(4096, None);
        let err = peer.receive(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err, IpcError::Timeout);
    }

    #[test]
    fn large_body_escapes_through_shm() {
        let shm = Arc::new(SharedMemoryPool::initialize("das_ipc_test_loopback_shm", 1 << 20).unwrap());
        let (host, peer) = pair(128, Some(shm.clone()));
        let header = MessageHeader::for_object(2, MessageType::Request, 7, 1, ObjectId::new(1, 1, 1), 0);
        let body = vec![0xABu8; 65_536];
        let used_before = shm.used_size();
        host.send(header, &body).unwrap();
        let frame = peer.receive(Duration::from_millis(100)).unwrap();
        assert!(frame.header.is_large_message());
        assert_eq!(frame.body, body);
        assert_eq!(shm.used_size(), used_before);
    }
}
