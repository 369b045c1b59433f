use crate::{
    discv5::{
        routing::MAX_NODES_PER_BUCKET,
        server::{Discovery, FIND_NODE_RESULT_LIMIT},
    },
    types::{Node, NodeRecord},
    utils::{log_distance, valid_relayed_addr, xor_distance},
};
use ethereum_types::H256;
use futures::future::join_all;
use rustc_hash::FxHashSet;
use std::time::Instant;
use tracing::trace;

/// Concurrency factor of the iterative search: how many FINDNODE queries
/// run at once.
pub const ALPHA: usize = 3;
/// Bucket distances asked per FINDNODE query.
pub const LOOKUP_REQUEST_LIMIT: usize = 3;

/// The distances to ask `peer` for when searching `target`: the exact
/// distance between them first, then alternating around it, clamped to the
/// valid [1, 256] range.
pub fn lookup_distances(target: &H256, peer: &H256) -> Vec<u64> {
    let d = log_distance(target, peer);
    let mut distances = Vec::with_capacity(LOOKUP_REQUEST_LIMIT);
    if d > 0 {
        distances.push(d);
    }
    let mut offset = 1;
    while distances.len() < LOOKUP_REQUEST_LIMIT && offset <= 256 {
        if d + offset <= 256 {
            distances.push(d + offset);
        }
        if distances.len() < LOOKUP_REQUEST_LIMIT && d > offset {
            distances.push(d - offset);
        }
        offset += 1;
    }
    distances
}

/// Filters a NODES reply down to the records worth trusting: unique ids,
/// valid signatures, plausible endpoints relative to the sender, and a
/// distance to the sender that was actually asked for.
pub(crate) fn verify_nodes_records(
    records: &[NodeRecord],
    sender: &Node,
    distances: &[u64],
) -> Vec<(Node, NodeRecord)> {
    let sender_id = sender.node_id();
    let mut verified = Vec::new();
    let mut seen_ids = FxHashSet::default();
    for record in records.iter().take(FIND_NODE_RESULT_LIMIT) {
        let Ok(node) = Node::from_record(record) else {
            trace!(from = %sender_id, "Dropping record without a usable endpoint");
            continue;
        };
        let id = node.node_id();
        if !seen_ids.insert(id) {
            trace!(from = %sender_id, "Dropping duplicate record in reply");
            continue;
        }
        if !record.verify_signature() {
            trace!(from = %sender_id, "Dropping record with invalid signature");
            continue;
        }
        if !valid_relayed_addr(sender.ip, node.ip) {
            trace!(from = %sender_id, ip = %node.ip, "Dropping record with implausible address");
            continue;
        }
        if !distances.contains(&log_distance(&sender_id, &id)) {
            trace!(from = %sender_id, "Dropping record outside the asked distances");
            continue;
        }
        verified.push((node, record.clone()));
    }
    verified
}

fn insert_by_distance(closest: &mut Vec<Node>, target: &H256, node: Node) {
    let d = xor_distance(target, &node.node_id());
    let pos = closest.partition_point(|n| xor_distance(target, &n.node_id()) <= d);
    closest.insert(pos, node);
}

impl Discovery {
    /// Iterative search for the `K` nodes closest to `target`, sorted by
    /// ascending distance.
    pub async fn lookup(&self, target: H256) -> Vec<Node> {
        self.iterative_search(target, true).await
    }

    /// Same walk as [`lookup`](Self::lookup) but without narrowing the
    /// result set, returning every node the search touched. Used by the
    /// random-target table refresh, where coverage beats precision.
    pub async fn query(&self, target: H256) -> Vec<Node> {
        self.iterative_search(target, false).await
    }

    async fn iterative_search(&self, target: H256, narrow: bool) -> Vec<Node> {
        *self.last_lookup.lock().await = Instant::now();
        let local_id = self.local_node().node_id();

        let mut closest: Vec<Node> = self
            .table
            .lock()
            .await
            .neighbours(&target, MAX_NODES_PER_BUCKET, false)
            .into_iter()
            .map(|e| e.node)
            .collect();

        let mut seen: FxHashSet<H256> = closest.iter().map(|n| n.node_id()).collect();
        seen.insert(local_id);
        let mut asked: FxHashSet<H256> = FxHashSet::default();
        asked.insert(local_id);

        loop {
            let batch: Vec<Node> = closest
                .iter()
                .filter(|n| !asked.contains(&n.node_id()))
                .take(ALPHA)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            for node in &batch {
                asked.insert(node.node_id());
            }

            let replies = join_all(batch.iter().map(|node| async move {
                let distances = lookup_distances(&target, &node.node_id());
                let result = self.find_node(node, distances.clone()).await;
                (node, distances, result)
            }))
            .await;

            for (node, distances, result) in replies {
                let records = match result {
                    Ok(records) => records,
                    Err(e) => {
                        trace!(node = %node.node_id(), err = %e, "Lookup query failed");
                        continue;
                    }
                };
                for (found, record) in verify_nodes_records(&records, node, &distances) {
                    let id = found.node_id();
                    // Best-effort insert; the table applies its own limits.
                    self.table.lock().await.add(found.clone(), record, false);
                    if seen.insert(id) {
                        insert_by_distance(&mut closest, &target, found);
                    }
                }
                if narrow {
                    closest.truncate(MAX_NODES_PER_BUCKET);
                }
            }
        }

        if narrow {
            closest.truncate(MAX_NODES_PER_BUCKET);
        }
        closest
    }
}
