use ethereum_types::H256;
use indexmap::IndexMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const DEFAULT_VOTE_TTL: Duration = Duration::from_secs(10 * 60);

/// Tallies what other nodes report as our external UDP endpoint. One live
/// vote per node id; a node changing its mind overwrites its previous vote.
#[derive(Debug)]
pub struct IpVote {
    votes: IndexMap<H256, (SocketAddr, Instant)>,
    ttl: Duration,
}

impl Default for IpVote {
    fn default() -> Self {
        Self::new(DEFAULT_VOTE_TTL)
    }
}

impl IpVote {
    pub fn new(ttl: Duration) -> Self {
        Self {
            votes: IndexMap::new(),
            ttl,
        }
    }

    pub fn insert(&mut self, voter: H256, addr: SocketAddr) {
        self.votes.insert(voter, (addr, Instant::now()));
    }

    /// The address reported by strictly more than half of the live voters,
    /// if any. Expired votes are discarded on the way.
    pub fn majority(&mut self) -> Option<SocketAddr> {
        let now = Instant::now();
        self.votes
            .retain(|_, (_, cast_at)| now.duration_since(*cast_at) < self.ttl);

        let mut tally: IndexMap<SocketAddr, usize> = IndexMap::new();
        for (addr, _) in self.votes.values() {
            *tally.entry(*addr).or_insert(0) += 1;
        }
        let total = self.votes.len();
        tally
            .into_iter()
            .find(|(_, count)| *count * 2 > total)
            .map(|(addr, _)| addr)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}
