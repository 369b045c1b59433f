use crate::types::{Node, NodeRecord};
use crate::utils::{log_distance, xor_distance};
use ethereum_types::H256;
use indexmap::IndexMap;
use rand::{Rng, seq::SliceRandom};
use rustc_hash::FxHashSet;
use std::net::IpAddr;
use std::time::Instant;
use tracing::debug;

/// Bucket capacity, the `k` of the Kademlia literature.
pub const MAX_NODES_PER_BUCKET: usize = 16;
const NUM_BUCKETS: usize = 256;
pub const DEFAULT_BUCKET_IP_LIMIT: usize = 2;
pub const DEFAULT_TABLE_IP_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct TableEntry {
    pub node: Node,
    pub record: NodeRecord,
    /// Whether the node ever answered one of our own requests. Only seen
    /// nodes are handed out to other peers.
    pub seen: bool,
    pub last_seen: Instant,
}

impl TableEntry {
    fn new(node: Node, record: NodeRecord, seen: bool) -> Self {
        Self {
            node,
            record,
            seen,
            last_seen: Instant::now(),
        }
    }
}

/// Entries ordered most-recently-seen first, plus a cache of candidates to
/// promote when a resident entry dies.
#[derive(Debug, Default)]
struct Bucket {
    entries: Vec<TableEntry>,
    replacements: Vec<TableEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Existing,
    ReplacementAdded,
    IpLimitReached,
    LocalNode,
}

/// Kademlia-style routing table: 256 buckets indexed by the log-distance to
/// the local id, with per-subnet occupancy limits to blunt address-space
/// concentration.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: H256,
    buckets: Vec<Bucket>,
    bootstrap_ids: FxHashSet<H256>,
    /// Table-wide subnet occupancy, covering entries and replacements.
    subnet_counts: IndexMap<Vec<u8>, usize>,
    bucket_ip_limit: usize,
    table_ip_limit: usize,
}

/// /24 for ipv4, /64 for ipv6.
fn subnet_key(ip: IpAddr) -> Vec<u8> {
    match ip.to_canonical() {
        IpAddr::V4(ip) => ip.octets()[..3].to_vec(),
        IpAddr::V6(ip) => ip.octets()[..8].to_vec(),
    }
}

impl RoutingTable {
    pub fn new(local_id: H256, bucket_ip_limit: usize, table_ip_limit: usize) -> Self {
        Self {
            local_id,
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::default()).collect(),
            bootstrap_ids: FxHashSet::default(),
            subnet_counts: IndexMap::new(),
            bucket_ip_limit,
            table_ip_limit,
        }
    }

    pub fn local_id(&self) -> H256 {
        self.local_id
    }

    /// Bootstrap nodes are exempt from failure-driven eviction.
    pub fn mark_bootstrap(&mut self, id: H256) {
        self.bootstrap_ids.insert(id);
    }

    pub fn is_bootstrap(&self, id: &H256) -> bool {
        self.bootstrap_ids.contains(id)
    }

    fn bucket_index(&self, id: &H256) -> Option<usize> {
        match log_distance(&self.local_id, id) {
            0 => None,
            d => Some(d as usize - 1),
        }
    }

    pub fn add(&mut self, node: Node, record: NodeRecord, seen: bool) -> AddOutcome {
        let id = node.node_id();
        let Some(index) = self.bucket_index(&id) else {
            return AddOutcome::LocalNode;
        };
        let subnet = subnet_key(node.ip);
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.entries.iter().position(|e| e.node.node_id() == id) {
            Self::refresh_entry(&mut bucket.entries[pos], node, record);
            if seen {
                let mut entry = bucket.entries.remove(pos);
                entry.seen = true;
                entry.last_seen = Instant::now();
                bucket.entries.insert(0, entry);
            }
            return AddOutcome::Existing;
        }
        if let Some(pos) = bucket
            .replacements
            .iter()
            .position(|e| e.node.node_id() == id)
        {
            Self::refresh_entry(&mut bucket.replacements[pos], node, record);
            return AddOutcome::Existing;
        }

        let bucket_subnet_count = bucket
            .entries
            .iter()
            .chain(&bucket.replacements)
            .filter(|e| subnet_key(e.node.ip) == subnet)
            .count();
        let table_subnet_count = self.subnet_counts.get(&subnet).copied().unwrap_or(0);
        if bucket_subnet_count >= self.bucket_ip_limit || table_subnet_count >= self.table_ip_limit
        {
            return AddOutcome::IpLimitReached;
        }

        let entry = TableEntry::new(node, record, seen);
        if bucket.entries.len() < MAX_NODES_PER_BUCKET {
            bucket.entries.insert(0, entry);
            *self.subnet_counts.entry(subnet).or_insert(0) += 1;
            AddOutcome::Added
        } else {
            if bucket.replacements.len() >= MAX_NODES_PER_BUCKET {
                if let Some(evicted) = bucket.replacements.pop() {
                    Self::decrement_subnet(&mut self.subnet_counts, evicted.node.ip);
                }
            }
            bucket.replacements.insert(0, entry);
            *self.subnet_counts.entry(subnet).or_insert(0) += 1;
            AddOutcome::ReplacementAdded
        }
    }

    fn refresh_entry(entry: &mut TableEntry, node: Node, record: NodeRecord) {
        if record.seq > entry.record.seq {
            entry.node = node;
            entry.record = record;
        }
    }

    fn decrement_subnet(counts: &mut IndexMap<Vec<u8>, usize>, ip: IpAddr) {
        let key = subnet_key(ip);
        if let Some(count) = counts.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.shift_remove(&key);
            }
        }
    }

    pub fn get(&self, id: &H256) -> Option<&TableEntry> {
        let index = self.bucket_index(id)?;
        self.buckets[index]
            .entries
            .iter()
            .find(|e| e.node.node_id() == *id)
    }

    /// The `k` resident entries closest to `target` by XOR distance.
    pub fn neighbours(&self, target: &H256, k: usize, seen_only: bool) -> Vec<TableEntry> {
        let mut entries: Vec<TableEntry> = self
            .buckets
            .iter()
            .flat_map(|b| &b.entries)
            .filter(|e| !seen_only || e.seen)
            .cloned()
            .collect();
        entries.sort_by_key(|e| xor_distance(target, &e.node.node_id()));
        entries.truncate(k);
        entries
    }

    /// Resident entries whose bucket distance is in `distances`, up to
    /// `limit` of them.
    pub fn entries_at_distances(
        &self,
        distances: &[u64],
        seen_only: bool,
        limit: usize,
    ) -> Vec<TableEntry> {
        let mut result = Vec::new();
        for &distance in distances {
            if distance == 0 || distance > NUM_BUCKETS as u64 {
                continue;
            }
            let bucket = &self.buckets[distance as usize - 1];
            for entry in &bucket.entries {
                if seen_only && !entry.seen {
                    continue;
                }
                if result.len() >= limit {
                    return result;
                }
                result.push(entry.clone());
            }
        }
        result
    }

    /// The least-recently-seen entry of a random non-empty bucket, the next
    /// candidate for liveness revalidation.
    pub fn node_to_revalidate<R: Rng>(&self, rng: &mut R) -> Option<Node> {
        let non_empty: Vec<&Bucket> = self.buckets.iter().filter(|b| !b.entries.is_empty()).collect();
        let bucket = non_empty.choose(rng)?;
        bucket.entries.last().map(|e| e.node.clone())
    }

    /// Removes a node that stopped answering, promoting the freshest
    /// replacement into its bucket. Bootstrap nodes are kept.
    pub fn replace_node(&mut self, id: &H256) {
        if self.bootstrap_ids.contains(id) {
            debug!(node = %id, "Bootstrap node failed revalidation, keeping it");
            return;
        }
        let Some(index) = self.bucket_index(id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        let Some(pos) = bucket.entries.iter().position(|e| e.node.node_id() == *id) else {
            return;
        };
        let removed = bucket.entries.remove(pos);
        Self::decrement_subnet(&mut self.subnet_counts, removed.node.ip);
        debug!(node = %removed.node, "Removed unresponsive node from table");

        if !bucket.replacements.is_empty() {
            // Freshest replacement first; it enters unverified at the tail.
            let promoted = bucket.replacements.remove(0);
            bucket.entries.push(promoted);
        }
    }

    /// Moves a node to the head of its bucket after a successful exchange.
    pub fn set_just_seen(&mut self, id: &H256) {
        let Some(index) = self.bucket_index(id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.entries.iter().position(|e| e.node.node_id() == *id) {
            let mut entry = bucket.entries.remove(pos);
            entry.seen = true;
            entry.last_seen = Instant::now();
            bucket.entries.insert(0, entry);
        }
    }

    /// Installs a fresher record for a resident node.
    pub fn update_record(&mut self, id: &H256, record: NodeRecord) {
        let Some(index) = self.bucket_index(id) else {
            return;
        };
        let Some(entry) = self.buckets[index]
            .entries
            .iter_mut()
            .find(|e| e.node.node_id() == *id)
        else {
            return;
        };
        if record.seq <= entry.record.seq {
            return;
        }
        let Ok(node) = Node::from_record(&record) else {
            return;
        };
        if subnet_key(node.ip) != subnet_key(entry.node.ip) {
            let old_ip = entry.node.ip;
            *self.subnet_counts.entry(subnet_key(node.ip)).or_insert(0) += 1;
            entry.node = node;
            entry.record = record;
            Self::decrement_subnet(&mut self.subnet_counts, old_ip);
        } else {
            entry.node = node;
            entry.record = record;
        }
    }

    pub fn random_nodes<R: Rng>(&self, n: usize, rng: &mut R) -> Vec<Node> {
        let entries: Vec<&TableEntry> = self.buckets.iter().flat_map(|b| &b.entries).collect();
        entries
            .choose_multiple(rng, n)
            .map(|e| e.node.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }

    #[cfg(test)]
    fn bucket_of(&self, id: &H256) -> Option<(usize, &[TableEntry])> {
        let index = self.bucket_index(id)?;
        Some((index, &self.buckets[index].entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::public_key_from_signing_key;
    use secp256k1::SecretKey;
    use std::net::IpAddr;

    fn make_node(ip: &str) -> (Node, NodeRecord) {
        let signer = SecretKey::new(&mut rand::rngs::OsRng);
        let ip: IpAddr = ip.parse().unwrap();
        let node = Node::new(ip, 30303, 30303, public_key_from_signing_key(&signer));
        let record = NodeRecord::from_node(&node, 1, &signer).unwrap();
        (node, record)
    }

    fn local_table() -> RoutingTable {
        let (local, _) = make_node("127.0.0.1");
        RoutingTable::new(local.node_id(), DEFAULT_BUCKET_IP_LIMIT, DEFAULT_TABLE_IP_LIMIT)
    }

    /// Generates nodes until `n` of them land in the same bucket.
    fn nodes_in_same_bucket(
        table: &RoutingTable,
        n: usize,
        mut next_ip: impl FnMut(usize) -> String,
    ) -> Vec<(Node, NodeRecord)> {
        use std::collections::HashMap;
        let mut by_distance: HashMap<u64, Vec<(Node, NodeRecord)>> = HashMap::new();
        for i in 0.. {
            let (node, record) = make_node(&next_ip(i));
            let d = log_distance(&table.local_id, &node.node_id());
            let group = by_distance.entry(d).or_default();
            group.push((node, record));
            if group.len() == n {
                return by_distance.remove(&d).unwrap();
            }
        }
        unreachable!()
    }

    #[test]
    fn added_nodes_land_in_their_distance_bucket() {
        let mut table = local_table();
        for i in 0..16 {
            let (node, record) = make_node(&format!("10.0.{i}.1"));
            let id = node.node_id();
            assert_eq!(table.add(node, record, false), AddOutcome::Added);

            let d = log_distance(&table.local_id, &id);
            let (index, entries) = table.bucket_of(&id).unwrap();
            assert_eq!(index as u64, d - 1);
            assert!(entries.iter().any(|e| e.node.node_id() == id));
        }
        assert_eq!(table.len(), 16);
    }

    #[test]
    fn add_is_idempotent() {
        let mut table = local_table();
        let (node, record) = make_node("10.0.0.1");
        assert_eq!(table.add(node.clone(), record.clone(), false), AddOutcome::Added);
        assert_eq!(table.add(node, record, false), AddOutcome::Existing);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn local_node_is_never_inserted() {
        let (local, record) = make_node("127.0.0.1");
        let mut table =
            RoutingTable::new(local.node_id(), DEFAULT_BUCKET_IP_LIMIT, DEFAULT_TABLE_IP_LIMIT);
        assert_eq!(table.add(local, record, true), AddOutcome::LocalNode);
        assert!(table.is_empty());
    }

    #[test]
    fn full_bucket_overflows_into_replacements_and_promotes() {
        let mut table = local_table();
        let group = nodes_in_same_bucket(&table, MAX_NODES_PER_BUCKET + 1, |i| {
            format!("10.{}.{}.1", i / 256 % 256, i % 256)
        });

        for (node, record) in &group[..MAX_NODES_PER_BUCKET] {
            assert_eq!(table.add(node.clone(), record.clone(), false), AddOutcome::Added);
        }
        let (extra_node, extra_record) = group[MAX_NODES_PER_BUCKET].clone();
        let extra_id = extra_node.node_id();
        assert_eq!(
            table.add(extra_node, extra_record, false),
            AddOutcome::ReplacementAdded
        );
        assert!(table.get(&extra_id).is_none());

        // Dropping a resident promotes the replacement into the bucket.
        let victim_id = group[0].0.node_id();
        table.replace_node(&victim_id);
        assert!(table.get(&victim_id).is_none());
        assert!(table.get(&extra_id).is_some());
        assert_eq!(table.len(), MAX_NODES_PER_BUCKET);
    }

    #[test]
    fn bucket_ip_limit_is_enforced() {
        let mut table = local_table();
        // All candidates share one /24.
        let group = nodes_in_same_bucket(&table, DEFAULT_BUCKET_IP_LIMIT + 1, |i| {
            format!("10.0.0.{}", (i % 250) + 1)
        });
        for (node, record) in &group[..DEFAULT_BUCKET_IP_LIMIT] {
            assert_eq!(table.add(node.clone(), record.clone(), false), AddOutcome::Added);
        }
        let (node, record) = group[DEFAULT_BUCKET_IP_LIMIT].clone();
        assert_eq!(table.add(node, record, false), AddOutcome::IpLimitReached);
    }

    #[test]
    fn table_ip_limit_is_enforced() {
        let mut table = local_table();
        let mut added = 0usize;
        let mut rejected = 0usize;
        // One /24, spread across many buckets: the per-bucket cap rarely
        // trips, the table-wide one must.
        for i in 0..100 {
            let (node, record) = make_node(&format!("10.0.0.{}", (i % 250) + 1));
            match table.add(node, record, false) {
                AddOutcome::Added => added += 1,
                AddOutcome::IpLimitReached => rejected += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert!(added <= DEFAULT_TABLE_IP_LIMIT);
        assert!(rejected > 0);
    }

    #[test]
    fn neighbours_are_sorted_and_bounded() {
        let mut table = local_table();
        let mut ids = Vec::new();
        for i in 0..40 {
            let (node, record) = make_node(&format!("10.0.{i}.1"));
            ids.push(node.node_id());
            table.add(node, record, false);
        }
        let target = ids[0];
        let neighbours = table.neighbours(&target, MAX_NODES_PER_BUCKET, false);
        assert!(neighbours.len() <= MAX_NODES_PER_BUCKET);
        for pair in neighbours.windows(2) {
            assert!(
                xor_distance(&target, &pair[0].node.node_id())
                    <= xor_distance(&target, &pair[1].node.node_id())
            );
        }
        // No duplicates.
        let unique: std::collections::HashSet<_> =
            neighbours.iter().map(|e| e.node.node_id()).collect();
        assert_eq!(unique.len(), neighbours.len());
    }

    #[test]
    fn seen_only_filters_unverified_nodes() {
        let mut table = local_table();
        let (node, record) = make_node("10.0.0.1");
        let id = node.node_id();
        table.add(node, record, false);

        let d = log_distance(&table.local_id, &id);
        assert!(table.entries_at_distances(&[d], true, 16).is_empty());

        table.set_just_seen(&id);
        assert_eq!(table.entries_at_distances(&[d], true, 16).len(), 1);
    }

    #[test]
    fn revalidation_candidate_is_the_bucket_tail() {
        let mut table = local_table();
        let group = nodes_in_same_bucket(&table, 3, |i| format!("10.0.{i}.1"));
        for (node, record) in &group {
            table.add(node.clone(), record.clone(), false);
        }
        // Insertion puts newer nodes at the head, so the tail is the first
        // one added.
        let candidate = table.node_to_revalidate(&mut rand::rngs::OsRng).unwrap();
        assert_eq!(candidate.node_id(), group[0].0.node_id());

        table.set_just_seen(&group[0].0.node_id());
        let candidate = table.node_to_revalidate(&mut rand::rngs::OsRng).unwrap();
        assert_eq!(candidate.node_id(), group[1].0.node_id());
    }

    #[test]
    fn bootstrap_nodes_survive_replacement() {
        let mut table = local_table();
        let (node, record) = make_node("10.0.0.1");
        let id = node.node_id();
        table.add(node, record, false);
        table.mark_bootstrap(id);
        table.replace_node(&id);
        assert!(table.get(&id).is_some());
    }

    #[test]
    fn update_record_requires_fresher_seq() {
        let signer = SecretKey::new(&mut rand::rngs::OsRng);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let node = Node::new(ip, 30303, 30303, public_key_from_signing_key(&signer));
        let id = node.node_id();
        let record_v1 = NodeRecord::from_node(&node, 1, &signer).unwrap();
        let node_v2 = Node::new(ip, 30305, 30305, public_key_from_signing_key(&signer));
        let record_v2 = NodeRecord::from_node(&node_v2, 2, &signer).unwrap();

        let mut table = local_table();
        table.add(node, record_v1.clone(), true);

        table.update_record(&id, record_v1.clone());
        assert_eq!(table.get(&id).unwrap().record.seq, 1);

        table.update_record(&id, record_v2);
        let entry = table.get(&id).unwrap();
        assert_eq!(entry.record.seq, 2);
        assert_eq!(entry.node.udp_port, 30305);

        // Stale records never roll an entry back.
        table.update_record(&id, record_v1);
        assert_eq!(table.get(&id).unwrap().record.seq, 2);
    }
}
