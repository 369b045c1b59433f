use crate::discv5::messages::Message;
use crate::types::Node;
use bytes::Bytes;
use ethereum_types::H256;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// An outbound request awaiting any kind of answer, indexed by the AEAD
/// nonce it was sent under. A WHOAREYOU challenge names that nonce, which is
/// how a challenge is tied back to the message that must be re-sent inside
/// the handshake.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub node: Node,
    pub message: Message,
    pub sent_at: Instant,
}

/// Tracks in-flight requests: the nonce-indexed pending set, and the typed
/// rendezvous slots callers await on, keyed by `(peer id, request id)`.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    pending: IndexMap<[u8; 12], PendingRequest>,
    awaited: FxHashMap<(H256, Bytes), mpsc::UnboundedSender<Message>>,
}

impl RequestRegistry {
    pub fn insert_pending(&mut self, nonce: [u8; 12], node: Node, message: Message) {
        self.pending.insert(
            nonce,
            PendingRequest {
                node,
                message,
                sent_at: Instant::now(),
            },
        );
    }

    pub fn take_pending(&mut self, nonce: &[u8; 12]) -> Option<PendingRequest> {
        self.pending.swap_remove(nonce)
    }

    /// Drops pending entries older than `ttl`, returning how many were
    /// removed.
    pub fn prune_pending(&mut self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.pending.len();
        self.pending
            .retain(|_nonce, request| now.duration_since(request.sent_at) < ttl);
        before - self.pending.len()
    }

    /// Registers a rendezvous slot for a typed response. The returned
    /// receiver yields every matching message until the entry is removed.
    pub fn insert_awaited(
        &mut self,
        peer_id: H256,
        req_id: Bytes,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.awaited.insert((peer_id, req_id), tx);
        rx
    }

    /// Routes a response to its awaiting caller. Returns false when nothing
    /// matched, i.e. the message was unsolicited.
    pub fn resolve_awaited(&mut self, peer_id: H256, message: Message) -> bool {
        let key = (peer_id, message.req_id().clone());
        match self.awaited.get(&key) {
            Some(tx) => {
                if tx.send(message).is_err() {
                    // The caller timed out and dropped the receiver.
                    self.awaited.remove(&key);
                    return false;
                }
                true
            }
            None => false,
        }
    }

    pub fn remove_awaited(&mut self, peer_id: &H256, req_id: &Bytes) {
        self.awaited.remove(&(*peer_id, req_id.clone()));
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
