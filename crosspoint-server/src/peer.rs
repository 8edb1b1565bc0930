//! Connected-peer bookkeeping: one writer task and one bounded outbound
//! queue per connection, plus the registry used for broadcast fanout.
//!
//! Enqueueing never blocks. A peer whose queue hits the high-water mark
//! is dropped from the registry; its writer task then drains and closes
//! the socket, and the reader side observes the close and cleans up.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crosspoint_core::PeerId;

/// Outbound queue depth per peer; overflow disconnects the peer.
pub const PEER_QUEUE_DEPTH: usize = 256;

// Peer ids are unique across every engine in the process so that the
// model's lock-owner handles can never collide. Zero is the local UI.
static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

pub fn alloc_peer_id() -> PeerId {
    NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Handle for enqueueing bytes to one peer.
#[derive(Clone)]
pub struct PeerHandle {
    pub id: PeerId,
    pub addr: SocketAddr,
    tx: mpsc::Sender<Bytes>,
}

impl PeerHandle {
    pub fn new(id: PeerId, addr: SocketAddr) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        (Self { id, addr, tx }, rx)
    }

    /// Non-blocking enqueue. Returns false when the queue is full or
    /// the writer has gone away.
    pub fn try_send(&self, bytes: Bytes) -> bool {
        self.tx.try_send(bytes).is_ok()
    }
}

/// Registry of Ready peers for one engine.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerId, PeerHandle>>,
}

impl PeerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, handle: PeerHandle) {
        self.peers.lock().insert(handle.id, handle);
    }

    pub fn remove(&self, id: PeerId) -> Option<PeerHandle> {
        self.peers.lock().remove(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Enqueue to a single peer; a full queue evicts it.
    pub fn send_to(&self, id: PeerId, bytes: Bytes) {
        let mut peers = self.peers.lock();
        if let Some(handle) = peers.get(&id) {
            if !handle.try_send(bytes) {
                warn!("[Peer {id}] outbound queue overflow, disconnecting");
                peers.remove(&id);
            }
        }
    }

    /// Fan out per-peer bytes to every registered peer. `f` may return
    /// `None` to skip a peer. Peers whose queue overflows are evicted.
    pub fn broadcast_with(&self, mut f: impl FnMut(PeerId) -> Option<Bytes>) {
        let mut peers = self.peers.lock();
        let mut evicted = Vec::new();
        for (id, handle) in peers.iter() {
            if let Some(bytes) = f(*id) {
                if !handle.try_send(bytes) {
                    warn!("[Peer {id}] outbound queue overflow, disconnecting");
                    evicted.push(*id);
                }
            }
        }
        for id in evicted {
            peers.remove(&id);
        }
    }

    /// Same bytes to every peer.
    pub fn broadcast(&self, bytes: &Bytes) {
        self.broadcast_with(|_| Some(bytes.clone()));
    }

    /// Drop every peer; their writer tasks drain and close.
    pub fn clear(&self) {
        self.peers.lock().clear();
    }
}

/// Writer task: drains the outbound queue into the socket and shuts the
/// write half down once the queue closes.
pub fn spawn_writer(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                debug!("peer write failed: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_peer_ids_are_unique_and_nonzero() {
        let a = alloc_peer_id();
        let b = alloc_peer_id();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_overflow_evicts_peer() {
        let registry = PeerRegistry::new();
        let (handle, _rx) = PeerHandle::new(alloc_peer_id(), dummy_addr());
        let id = handle.id;
        registry.insert(handle);

        // nobody drains _rx, so the queue eventually fills
        for _ in 0..=PEER_QUEUE_DEPTH {
            registry.send_to(id, Bytes::from_static(b"x"));
        }
        assert!(!registry.contains(id));
    }

    #[tokio::test]
    async fn test_broadcast_skips_with_none() {
        let registry = PeerRegistry::new();
        let (a, mut rx_a) = PeerHandle::new(alloc_peer_id(), dummy_addr());
        let (b, mut rx_b) = PeerHandle::new(alloc_peer_id(), dummy_addr());
        let (id_a, id_b) = (a.id, b.id);
        registry.insert(a);
        registry.insert(b);

        registry.broadcast_with(|id| {
            if id == id_a {
                Some(Bytes::from_static(b"hello"))
            } else {
                None
            }
        });
        assert_eq!(rx_a.try_recv().unwrap(), Bytes::from_static(b"hello"));
        assert!(rx_b.try_recv().is_err());
        let _ = id_b;
    }
}
