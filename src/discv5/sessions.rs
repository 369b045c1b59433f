use crate::discv5::session::SessionKeys;
use ethereum_types::H256;
use indexmap::IndexMap;
use rand::RngCore;
use std::net::SocketAddr;

/// Upper bound on live sessions. The store is a DoS surface: a peer able to
/// grow it without bound could evict every honest session.
pub const SESSION_STORE_CAPACITY: usize = 256;

/// Sessions are scoped to the peer id *and* its address; a peer that moves
/// has to handshake again.
pub type SessionIndex = (H256, SocketAddr);

#[derive(Debug, Clone)]
pub struct Session {
    pub keys: SessionKeys,
    /// Outgoing message count, encoded into the first nonce bytes.
    counter: u32,
}

impl Session {
    pub fn new(keys: SessionKeys) -> Self {
        Self { keys, counter: 0 }
    }

    /// Generates a 96-bit AEAD nonce: the outgoing message count in the
    /// first 32 bits, the remaining 64 filled from a secure RNG.
    pub fn next_nonce<R: RngCore>(&mut self, rng: &mut R) -> [u8; 12] {
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);

        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&counter.to_be_bytes());
        rng.fill_bytes(&mut nonce[4..]);
        nonce
    }
}

/// Bounded LRU map of per-peer session keys. A completed handshake always
/// overwrites whatever session existed for its index.
#[derive(Debug)]
pub struct SessionStore {
    sessions: IndexMap<SessionIndex, Session>,
    capacity: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SESSION_STORE_CAPACITY)
    }
}

impl SessionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: IndexMap::new(),
            capacity,
        }
    }

    pub fn insert(&mut self, index: SessionIndex, keys: SessionKeys) {
        self.sessions.shift_remove(&index);
        if self.sessions.len() >= self.capacity {
            // Front of the map is the least recently used entry.
            self.sessions.shift_remove_index(0);
        }
        self.sessions.insert(index, Session::new(keys));
    }

    /// Looks up a session and marks it most recently used.
    pub fn get(&mut self, index: &SessionIndex) -> Option<&mut Session> {
        let idx = self.sessions.get_index_of(index)?;
        let last = self.sessions.len() - 1;
        self.sessions.move_index(idx, last);
        self.sessions.get_mut(index)
    }

    pub fn has(&self, index: &SessionIndex) -> bool {
        self.sessions.contains_key(index)
    }

    pub fn remove(&mut self, index: &SessionIndex) {
        self.sessions.shift_remove(index);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(n: u8) -> SessionIndex {
        let mut id = [0u8; 32];
        id[0] = n;
        (H256(id), format!("127.0.0.1:{}", 20000 + n as u16).parse().unwrap())
    }

    fn keys(n: u8) -> SessionKeys {
        SessionKeys {
            outbound_key: [n; 16],
            inbound_key: [n.wrapping_add(1); 16],
        }
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut store = SessionStore::new(2);
        store.insert(index(1), keys(1));
        store.insert(index(2), keys(2));

        // Touch 1 so 2 becomes the eviction candidate.
        assert!(store.get(&index(1)).is_some());
        store.insert(index(3), keys(3));

        assert!(store.has(&index(1)));
        assert!(!store.has(&index(2)));
        assert!(store.has(&index(3)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn handshake_overwrites_existing_session() {
        let mut store = SessionStore::new(2);
        store.insert(index(1), keys(1));
        store.insert(index(1), keys(9));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&index(1)).unwrap().keys, keys(9));
    }

    #[test]
    fn nonce_carries_message_counter() {
        let mut rng = rand::rngs::OsRng;
        let mut session = Session::new(keys(1));
        let n1 = session.next_nonce(&mut rng);
        let n2 = session.next_nonce(&mut rng);
        assert_eq!(&n1[..4], &[0, 0, 0, 0]);
        assert_eq!(&n2[..4], &[0, 0, 0, 1]);
        assert_ne!(&n1[4..], &n2[4..]);
    }
}
