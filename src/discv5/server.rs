use crate::{
    discv5::{
        codec::PacketCodec,
        ip_vote::IpVote,
        messages::{
            FindNodeMessage, Handshake, HandshakeAuthdata, HANDSHAKE_FLAG, Message, NodesMessage,
            ORDINARY_FLAG, Ordinary, PacketCodecError, PacketEnvelope, PingMessage, PongMessage,
            TalkReqMessage, TalkRespMessage, WHO_ARE_YOU_FLAG, WhoAreYou, encode_random_packet,
        },
        requests::RequestRegistry,
        routing::{
            AddOutcome, DEFAULT_BUCKET_IP_LIMIT, DEFAULT_TABLE_IP_LIMIT, MAX_NODES_PER_BUCKET,
            RoutingTable,
        },
        session::{create_id_signature, derive_session_keys, verify_id_signature},
        sessions::{SessionIndex, SessionStore},
        talk::{TalkError, TalkHandler, TalkRegistry},
    },
    metrics::METRICS,
    types::{Node, NodeError, NodeRecord},
    utils::{compress_public_key, public_key_from_signing_key},
};
use bytes::Bytes;
use ethereum_types::H256;
use futures::StreamExt;
use indexmap::IndexMap;
use parking_lot::RwLock;
use rand::{Rng, RngCore, rngs::OsRng};
use secp256k1::{PublicKey, SecretKey, ecdsa::Signature};
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{net::UdpSocket, sync::Mutex, sync::mpsc, time};
use tokio_util::{sync::CancellationToken, task::TaskTracker, udp::UdpFramed};
use tracing::{debug, error, info, trace};

/// Maximum number of records a FINDNODE answer spans, across all NODES
/// messages of the response.
pub const FIND_NODE_RESULT_LIMIT: usize = 16;
/// Records per NODES message. Worst-case records at this count still fit the
/// maximum packet size.
pub const MAX_NODES_PER_MESSAGE: usize = 3;
/// Cadence of the pending-request / stale-challenge sweep.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP listen endpoint. Port 0 binds an ephemeral port.
    pub bind_address: SocketAddr,
    /// Seed records loaded at `open`. Never evicted on failure.
    pub bootstrap_records: Vec<NodeRecord>,
    /// Re-sign the local record when the external-address vote disagrees.
    pub enr_auto_update: bool,
    /// Nodes per subnet allowed in one bucket.
    pub bucket_ip_limit: usize,
    /// Nodes per subnet allowed across the table.
    pub table_ip_limit: usize,
    /// How long a WHOAREYOU challenge waits for its handshake.
    pub handshake_timeout: Duration,
    /// How long a request waits for its typed response.
    pub response_timeout: Duration,
    /// A random-target query runs whenever no lookup happened for this long.
    pub refresh_interval: Duration,
    /// Cadence of the external-address vote tally.
    pub ip_majority_interval: Duration,
    /// Upper bound of the randomized revalidation pause.
    pub revalidate_max: Duration,
    /// Random-target queries run right after the initial self-lookup.
    pub initial_lookups: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:30303".parse().expect("valid constant address"),
            bootstrap_records: Vec::new(),
            enr_auto_update: false,
            bucket_ip_limit: DEFAULT_BUCKET_IP_LIMIT,
            table_ip_limit: DEFAULT_TABLE_IP_LIMIT,
            handshake_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(4),
            refresh_interval: Duration::from_secs(5 * 60),
            ip_majority_interval: Duration::from_secs(5 * 60),
            revalidate_max: Duration::from_secs(10),
            initial_lookups: 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Failed to decode packet")]
    DecodeError(#[from] PacketCodecError),
    #[error("Request timed out")]
    Timeout,
    #[error("Unexpected response kind {0}")]
    UnexpectedResponse(&'static str),
    #[error(transparent)]
    InvalidRecord(#[from] NodeError),
    #[error("Record signature verification failed")]
    InvalidRecordSignature,
    #[error("Cryptography error: {0}")]
    CryptographyError(String),
    #[error(transparent)]
    Talk(#[from] TalkError),
}

/// What a peer told us about ourselves in a PONG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PongInfo {
    pub enr_seq: u64,
    pub observed_ip: std::net::IpAddr,
    pub observed_port: u16,
}

/// An issued WHOAREYOU challenge, waiting for its handshake message. The
/// challenge-data is what the handshake signature and key derivation bind
/// to, so it must be the exact bytes that went on the wire.
#[derive(Debug, Clone)]
struct Challenge {
    challenge_data: Vec<u8>,
    sent_at: Instant,
}

/// The discovery protocol instance.
///
/// Cheap to clone; all clones share the same socket and state. `open` binds
/// the socket and seeds the table, `start` spawns the server and maintenance
/// loops, `close` tears everything down.
#[derive(Clone)]
pub struct Discovery {
    local_node: Node,
    signer: SecretKey,
    local_record: Arc<RwLock<NodeRecord>>,
    udp_socket: Arc<UdpSocket>,
    pub(crate) table: Arc<Mutex<RoutingTable>>,
    sessions: Arc<Mutex<SessionStore>>,
    requests: Arc<Mutex<RequestRegistry>>,
    challenges: Arc<Mutex<IndexMap<SessionIndex, Challenge>>>,
    talk: Arc<TalkRegistry>,
    ip_votes: Arc<Mutex<IpVote>>,
    pub(crate) config: Arc<DiscoveryConfig>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    pub(crate) last_lookup: Arc<Mutex<Instant>>,
}

impl Discovery {
    /// Binds the UDP socket, builds the local record, and seeds the routing
    /// table with the configured bootstrap records.
    pub async fn open(config: DiscoveryConfig, signer: SecretKey) -> Result<Self, DiscoveryError> {
        let udp_socket = UdpSocket::bind(config.bind_address).await?;
        let local_addr = udp_socket.local_addr()?;
        let local_node = Node::new(
            local_addr.ip(),
            local_addr.port(),
            local_addr.port(),
            public_key_from_signing_key(&signer),
        );
        let local_record = NodeRecord::from_node(&local_node, 1, &signer)?;
        let table = RoutingTable::new(
            local_node.node_id(),
            config.bucket_ip_limit,
            config.table_ip_limit,
        );

        let discovery = Self {
            local_node: local_node.clone(),
            signer,
            local_record: Arc::new(RwLock::new(local_record)),
            udp_socket: Arc::new(udp_socket),
            table: Arc::new(Mutex::new(table)),
            sessions: Arc::new(Mutex::new(SessionStore::default())),
            requests: Arc::new(Mutex::new(RequestRegistry::default())),
            challenges: Arc::new(Mutex::new(IndexMap::new())),
            talk: Arc::new(TalkRegistry::default()),
            ip_votes: Arc::new(Mutex::new(IpVote::default())),
            config: Arc::new(config),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            last_lookup: Arc::new(Mutex::new(Instant::now())),
        };

        {
            let mut table = discovery.table.lock().await;
            for record in &discovery.config.bootstrap_records {
                if !record.verify_signature() {
                    debug!("Skipping bootstrap record with invalid signature");
                    continue;
                }
                let Ok(node) = Node::from_record(record) else {
                    debug!("Skipping bootstrap record without a usable endpoint");
                    continue;
                };
                let id = node.node_id();
                table.add(node, record.clone(), false);
                table.mark_bootstrap(id);
            }
            info!(
                node_id = %local_node.node_id(),
                addr = %local_addr,
                bootstrap_count = table.len(),
                "Discovery opened"
            );
        }

        Ok(discovery)
    }

    /// Spawns the server loop and the background maintenance tasks.
    pub fn start(&self) {
        self.tracker.spawn(self.clone().receive_loop());
        self.tracker.spawn(self.clone().revalidation_loop());
        self.tracker.spawn(self.clone().refresh_loop());
        self.tracker.spawn(self.clone().ip_majority_loop());
        self.tracker.spawn(self.clone().housekeeping_loop());
    }

    /// Cancels the background tasks. The UDP socket closes once the last
    /// clone is dropped.
    pub fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
    }

    /// Like [`close`](Self::close), but waits for the tasks to finish.
    pub async fn close_wait(&self) {
        self.close();
        self.tracker.wait().await;
    }

    pub fn local_node(&self) -> &Node {
        &self.local_node
    }

    pub fn local_record(&self) -> NodeRecord {
        self.local_record.read().clone()
    }

    /// Replaces the advertised UDP endpoint of the local record, bumping its
    /// seq and re-signing it. Peers pick the change up on their next
    /// handshake or record refresh.
    pub fn update_record(&self, addr: SocketAddr) -> Result<NodeRecord, NodeError> {
        let mut record = self.local_record.write();
        record.set_udp_address(addr, &self.signer)?;
        Ok(record.clone())
    }

    /// Registers a talk sub-protocol handler.
    pub fn register_talk_protocol(
        &self,
        protocol: Vec<u8>,
        handler: Arc<dyn TalkHandler>,
    ) -> Result<(), TalkError> {
        self.talk.register(protocol, handler)
    }

    /// Inserts a verified record into the routing table.
    pub async fn add_node(&self, record: NodeRecord) -> Result<AddOutcome, DiscoveryError> {
        if !record.verify_signature() {
            return Err(DiscoveryError::InvalidRecordSignature);
        }
        let node = Node::from_record(&record)?;
        Ok(self.table.lock().await.add(node, record, false))
    }

    pub async fn get_node(&self, id: H256) -> Option<Node> {
        self.table.lock().await.get(&id).map(|e| e.node.clone())
    }

    pub async fn get_record(&self, id: H256) -> Option<NodeRecord> {
        self.table.lock().await.get(&id).map(|e| e.record.clone())
    }

    pub async fn random_nodes(&self, n: usize) -> Vec<Node> {
        self.table.lock().await.random_nodes(n, &mut OsRng)
    }

    pub async fn neighbours(&self, target: H256) -> Vec<Node> {
        self.table
            .lock()
            .await
            .neighbours(&target, MAX_NODES_PER_BUCKET, false)
            .into_iter()
            .map(|e| e.node)
            .collect()
    }

    /// Returns the freshest record known for `id`, asking the node itself
    /// when it is reachable and falling back to a network lookup.
    pub async fn resolve(&self, id: H256) -> Option<NodeRecord> {
        if let Some(node) = self.get_node(id).await {
            if let Some(record) = self.request_own_record(&node).await {
                return Some(record);
            }
        }
        self.lookup(id).await;
        self.get_record(id).await
    }

    /// PING a node, returning the peer's record seq and what it observed as
    /// our external endpoint.
    pub async fn ping(&self, node: &Node) -> Result<PongInfo, DiscoveryError> {
        let message = Message::Ping(PingMessage {
            req_id: new_req_id(),
            enr_seq: self.local_record.read().seq,
        });
        let (req_id, mut rx) = self.request(node, message).await?;
        let result = match time::timeout(self.config.response_timeout, rx.recv()).await {
            Ok(Some(Message::Pong(pong))) => Ok(PongInfo {
                enr_seq: pong.enr_seq,
                observed_ip: pong.recipient_ip,
                observed_port: pong.recipient_port,
            }),
            Ok(Some(other)) => Err(DiscoveryError::UnexpectedResponse(other.kind_name())),
            Ok(None) | Err(_) => Err(DiscoveryError::Timeout),
        };
        self.finish_request(node, &req_id, result.is_ok()).await;
        result
    }

    /// FINDNODE at the given bucket distances. Multi-part answers are
    /// accumulated; a partial answer on timeout is still returned.
    pub async fn find_node(
        &self,
        node: &Node,
        distances: Vec<u64>,
    ) -> Result<Vec<NodeRecord>, DiscoveryError> {
        let message = Message::FindNode(FindNodeMessage {
            req_id: new_req_id(),
            distances,
        });
        let (req_id, mut rx) = self.request(node, message).await?;
        let deadline = time::Instant::now() + self.config.response_timeout;

        let mut records: Vec<NodeRecord> = Vec::new();
        let mut total = None;
        let mut parts_received: u64 = 0;
        let outcome = loop {
            match time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Message::Nodes(m))) => {
                    // Bound what a malicious total can make us wait for.
                    let total =
                        *total.get_or_insert(m.total.clamp(1, FIND_NODE_RESULT_LIMIT as u64));
                    parts_received += 1;
                    records.extend(m.nodes);
                    if parts_received >= total || records.len() >= FIND_NODE_RESULT_LIMIT {
                        break Ok(());
                    }
                }
                Ok(Some(other)) => break Err(DiscoveryError::UnexpectedResponse(other.kind_name())),
                Ok(None) => break Err(DiscoveryError::Timeout),
                // Any parts seen so far beat no answer at all.
                Err(_) if parts_received > 0 => break Ok(()),
                Err(_) => break Err(DiscoveryError::Timeout),
            }
        };

        self.finish_request(node, &req_id, outcome.is_ok()).await;
        outcome.map(|()| {
            records.truncate(FIND_NODE_RESULT_LIMIT);
            records
        })
    }

    /// Sends a talk request to the given sub-protocol on the remote node and
    /// returns the raw response payload.
    pub async fn talk_req(
        &self,
        node: &Node,
        protocol: &[u8],
        payload: Vec<u8>,
    ) -> Result<Bytes, DiscoveryError> {
        let message = Message::TalkReq(TalkReqMessage {
            req_id: new_req_id(),
            protocol: Bytes::copy_from_slice(protocol),
            request: Bytes::from(payload),
        });
        let (req_id, mut rx) = self.request(node, message).await?;
        let result = match time::timeout(self.config.response_timeout, rx.recv()).await {
            Ok(Some(Message::TalkResp(resp))) => Ok(resp.response),
            Ok(Some(other)) => Err(DiscoveryError::UnexpectedResponse(other.kind_name())),
            Ok(None) | Err(_) => Err(DiscoveryError::Timeout),
        };
        self.finish_request(node, &req_id, result.is_ok()).await;
        result
    }

    /// Asks a node for its own record (`FINDNODE [0]`) and installs it if it
    /// is fresher than what the table holds.
    pub(crate) async fn request_own_record(&self, node: &Node) -> Option<NodeRecord> {
        let records = self.find_node(node, vec![0]).await.ok()?;
        let record = records.into_iter().next()?;
        if !record.verify_signature() {
            return None;
        }
        let id = node.node_id();
        if Node::from_record(&record).ok()?.node_id() != id {
            return None;
        }
        self.table.lock().await.update_record(&id, record.clone());
        Some(record)
    }

    // Request plumbing //

    /// Registers the rendezvous slot and sends the message. The caller
    /// awaits the returned receiver under its own timeout.
    async fn request(
        &self,
        node: &Node,
        message: Message,
    ) -> Result<(Bytes, mpsc::UnboundedReceiver<Message>), DiscoveryError> {
        let req_id = message.req_id().clone();
        let rx = self
            .requests
            .lock()
            .await
            .insert_awaited(node.node_id(), req_id.clone());
        METRICS.record_request_sent();
        if let Err(e) = self.send_message(node, message).await {
            self.requests
                .lock()
                .await
                .remove_awaited(&node.node_id(), &req_id);
            return Err(e);
        }
        Ok((req_id, rx))
    }

    /// Clears the rendezvous slot and applies the table contract: success
    /// promotes the peer, failure demotes it (bootstrap nodes excepted).
    async fn finish_request(&self, node: &Node, req_id: &Bytes, ok: bool) {
        let id = node.node_id();
        self.requests.lock().await.remove_awaited(&id, req_id);
        let mut table = self.table.lock().await;
        if ok {
            table.set_just_seen(&id);
            METRICS.record_request_resolved("ok");
        } else {
            table.replace_node(&id);
            METRICS.record_request_resolved("failed");
        }
    }

    /// Encodes and sends a request message, registering it as pending under
    /// its nonce. Without a session the message goes out as a random-data
    /// packet that provokes a WHOAREYOU challenge.
    async fn send_message(&self, node: &Node, message: Message) -> Result<(), DiscoveryError> {
        let dest_id = node.node_id();
        let addr = node.udp_addr();
        let mut rng = OsRng;
        let masking_iv: u128 = rng.r#gen();
        let mut buf = Vec::new();

        let nonce = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&(dest_id, addr)) {
                Some(session) => {
                    let nonce = session.next_nonce(&mut rng);
                    let write_key = session.keys.outbound_key;
                    Ordinary {
                        src_id: self.local_node.node_id(),
                        message: message.clone(),
                    }
                    .encode(&mut buf, masking_iv, &nonce, &dest_id, &write_key)?;
                    nonce
                }
                None => {
                    let mut nonce = [0u8; 12];
                    rng.fill_bytes(&mut nonce);
                    encode_random_packet(
                        &mut buf,
                        &mut rng,
                        masking_iv,
                        &nonce,
                        &self.local_node.node_id(),
                        &dest_id,
                    )?;
                    nonce
                }
            }
        };

        // Register before sending: the challenge racing back must find the
        // pending entry.
        self.requests
            .lock()
            .await
            .insert_pending(nonce, node.clone(), message.clone());
        let _ = self
            .udp_socket
            .send_to(&buf, addr)
            .await
            .inspect_err(|e| error!(sending = %message, %addr, err = ?e, "Error sending message"));
        trace!(msg = %message, node = %dest_id, %addr, "Request sent");
        Ok(())
    }

    /// Sends a response over the established session. Responses are never
    /// worth a handshake: without a session the peer gets nothing.
    async fn send_response(&self, dest_id: H256, addr: SocketAddr, message: Message) {
        let mut rng = OsRng;
        let masking_iv: u128 = rng.r#gen();
        let mut buf = Vec::new();
        {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get(&(dest_id, addr)) else {
                trace!(node = %dest_id, "No session to answer through, dropping response");
                return;
            };
            let nonce = session.next_nonce(&mut rng);
            let write_key = session.keys.outbound_key;
            if let Err(e) = (Ordinary {
                src_id: self.local_node.node_id(),
                message: message.clone(),
            })
            .encode(&mut buf, masking_iv, &nonce, &dest_id, &write_key)
            {
                debug!(err = %e, "Failed to encode response");
                return;
            }
        }
        let _ = self
            .udp_socket
            .send_to(&buf, addr)
            .await
            .inspect_err(|e| error!(sending = %message, %addr, err = ?e, "Error sending message"));
        trace!(msg = %message, node = %dest_id, %addr, "Response sent");
    }

    // Server loop //

    async fn receive_loop(self) {
        let mut stream = UdpFramed::new(
            self.udp_socket.clone(),
            PacketCodec::new(self.local_node.node_id()),
        );
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok((envelope, from))) => {
                        let _ = self
                            .handle_packet(envelope, from)
                            .await
                            // trace level, bad peers can spam decode errors
                            .inspect_err(|e| trace!(err = %e, "Error handling packet"));
                    }
                    Some(Err(e)) => {
                        debug!(err = %e, "Dropping undecodable datagram");
                    }
                    None => break,
                },
            }
        }
    }

    async fn handle_packet(
        &self,
        envelope: PacketEnvelope,
        from: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        match envelope.header.flag {
            ORDINARY_FLAG => self.handle_ordinary(envelope, from).await,
            WHO_ARE_YOU_FLAG => self.handle_who_are_you(envelope, from).await,
            HANDSHAKE_FLAG => self.handle_handshake(envelope, from).await,
            flag => {
                trace!(flag, "Dropping packet with unknown flag");
                Ok(())
            }
        }
    }

    async fn handle_ordinary(
        &self,
        envelope: PacketEnvelope,
        from: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        if envelope.header.authdata.len() != 32 {
            return Err(PacketCodecError::InvalidSize.into());
        }
        let src_id = H256::from_slice(&envelope.header.authdata);
        if src_id == self.local_node.node_id() {
            return Ok(());
        }

        let read_key = self
            .sessions
            .lock()
            .await
            .get(&(src_id, from))
            .map(|s| s.keys.inbound_key);

        match read_key {
            Some(key) => match Ordinary::decode(&envelope, &key) {
                Ok(ordinary) => {
                    trace!(received = %ordinary.message, from = %src_id, %from);
                    self.handle_message(ordinary.message, src_id, from).await;
                    Ok(())
                }
                Err(PacketCodecError::OpenFailed) => {
                    // Stale keys on the far side; challenge them to re-key.
                    self.send_challenge(src_id, envelope.header.nonce, from)
                        .await
                }
                Err(e) => Err(e.into()),
            },
            None => {
                self.send_challenge(src_id, envelope.header.nonce, from)
                    .await
            }
        }
    }

    /// Issues a WHOAREYOU for a packet we could not open. At most one
    /// challenge is in flight per `(node, address)`; further undecryptable
    /// packets are dropped until it resolves or expires.
    async fn send_challenge(
        &self,
        src_id: H256,
        request_nonce: [u8; 12],
        from: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        let enr_seq = self
            .table
            .lock()
            .await
            .get(&src_id)
            .map(|e| e.record.seq)
            .unwrap_or(0);

        let mut challenges = self.challenges.lock().await;
        if challenges.contains_key(&(src_id, from)) {
            trace!(node = %src_id, "Challenge already pending, dropping packet");
            return Ok(());
        }

        let mut rng = OsRng;
        let mut id_nonce = [0u8; 16];
        rng.fill_bytes(&mut id_nonce);
        let who_are_you = WhoAreYou { id_nonce, enr_seq };
        let masking_iv: u128 = rng.r#gen();
        let (wire, challenge_data) = who_are_you.encode(&request_nonce, masking_iv, &src_id)?;

        let _ = self
            .udp_socket
            .send_to(&wire, from)
            .await
            .inspect_err(|e| error!(sending = "WHOAREYOU", %from, err = ?e, "Error sending message"));
        trace!(node = %src_id, %from, "Challenge sent");

        challenges.insert(
            (src_id, from),
            Challenge {
                challenge_data,
                sent_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// The initiator half of the handshake: answer a challenge against one
    /// of our pending requests with a handshake message.
    async fn handle_who_are_you(
        &self,
        envelope: PacketEnvelope,
        from: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        let nonce = envelope.header.nonce;
        let Some(pending) = self.requests.lock().await.take_pending(&nonce) else {
            trace!(%from, "Unexpected WHOAREYOU, ignoring");
            METRICS.unsolicited_messages.inc();
            return Ok(());
        };
        let node = pending.node;
        let message = pending.message;
        if node.udp_addr() != from {
            // Someone other than the node we contacted answered; put the
            // pending entry back and wait for the real one.
            self.requests
                .lock()
                .await
                .insert_pending(nonce, node, message);
            trace!(%from, "WHOAREYOU from unexpected address, ignoring");
            return Ok(());
        }
        trace!(received = "WHOAREYOU", node = %node.node_id(), %from);

        let who_are_you = WhoAreYou::decode(&envelope)?;
        let challenge_data = envelope.challenge_data();

        let ephemeral_key = SecretKey::new(&mut rand::thread_rng());
        let ephemeral_pubkey = ephemeral_key.public_key(secp256k1::SECP256K1).serialize();

        let Some(dest_pubkey) = compress_public_key(&node.public_key) else {
            return Err(DiscoveryError::CryptographyError(
                "Invalid public key".to_string(),
            ));
        };

        let keys = derive_session_keys(
            &ephemeral_key,
            &dest_pubkey,
            &self.local_node.node_id(),
            &node.node_id(),
            &challenge_data,
            true,
        );
        let signature = create_id_signature(
            &self.signer,
            &challenge_data,
            &ephemeral_pubkey,
            &node.node_id(),
        );

        // The record rides along when the challenger's view of us is stale.
        let local_record = self.local_record.read().clone();
        let record = (who_are_you.enr_seq < local_record.seq).then_some(local_record);

        let handshake = Handshake {
            src_id: self.local_node.node_id(),
            id_signature: signature.serialize_compact().to_vec(),
            eph_pubkey: ephemeral_pubkey.to_vec(),
            record,
            message: message.clone(),
        };

        let write_key = keys.outbound_key;
        let send_nonce = {
            let mut sessions = self.sessions.lock().await;
            sessions.insert((node.node_id(), from), keys);
            let session = sessions
                .get(&(node.node_id(), from))
                .expect("session was just inserted");
            session.next_nonce(&mut OsRng)
        };

        let masking_iv: u128 = OsRng.r#gen();
        let mut buf = Vec::new();
        handshake.encode(&mut buf, masking_iv, &send_nonce, &node.node_id(), &write_key)?;
        self.requests
            .lock()
            .await
            .insert_pending(send_nonce, node.clone(), message.clone());
        let _ = self
            .udp_socket
            .send_to(&buf, from)
            .await
            .inspect_err(|e| error!(sending = "handshake", %from, err = ?e, "Error sending message"));
        trace!(msg = %message, node = %node.node_id(), "Handshake message sent");
        Ok(())
    }

    /// The recipient half of the handshake: verify the id signature against
    /// our challenge, derive the session, then process the embedded message.
    async fn handle_handshake(
        &self,
        envelope: PacketEnvelope,
        from: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        let authdata = HandshakeAuthdata::decode(&envelope)?;
        let src_id = authdata.src_id;

        let Some(challenge) = self.challenges.lock().await.swap_remove(&(src_id, from)) else {
            trace!(node = %src_id, "Handshake without pending challenge, ignoring");
            METRICS.unsolicited_messages.inc();
            return Ok(());
        };

        let record = match authdata.record {
            Some(record) => {
                if !record.verify_signature() {
                    debug!(node = %src_id, "Handshake record with bad signature");
                    return Ok(());
                }
                Some(record)
            }
            None => self.table.lock().await.get(&src_id).map(|e| e.record.clone()),
        };
        let Some(record) = record else {
            debug!(node = %src_id, "Handshake from unknown node without a record");
            return Ok(());
        };
        let node = Node::from_record(&record)?;
        if node.node_id() != src_id {
            debug!(node = %src_id, "Handshake record does not match the sender id");
            return Ok(());
        }

        let Some(src_pubkey) = compress_public_key(&node.public_key) else {
            return Err(DiscoveryError::CryptographyError(
                "Invalid public key".to_string(),
            ));
        };
        let Ok(signature) = Signature::from_compact(&authdata.id_signature) else {
            debug!(node = %src_id, "Handshake with malformed id signature");
            return Ok(());
        };
        if !verify_id_signature(
            &src_pubkey,
            &challenge.challenge_data,
            &authdata.eph_pubkey,
            &self.local_node.node_id(),
            &signature,
        ) {
            debug!(node = %src_id, "Handshake id signature verification failed");
            return Ok(());
        }
        let Ok(eph_pubkey) = PublicKey::from_slice(&authdata.eph_pubkey) else {
            debug!(node = %src_id, "Handshake with malformed ephemeral key");
            return Ok(());
        };

        let keys = derive_session_keys(
            &self.signer,
            &eph_pubkey,
            &src_id,
            &self.local_node.node_id(),
            &challenge.challenge_data,
            false,
        );
        let message = Handshake::open_message(&envelope, &keys.inbound_key)?;
        self.sessions.lock().await.insert((src_id, from), keys);

        // A completed handshake is proof enough to let the node into the
        // table; it still counts as unseen until it answers us.
        self.table.lock().await.add(node, record, false);

        trace!(received = %message, node = %src_id, "Handshake completed");
        self.handle_message(message, src_id, from).await;
        Ok(())
    }

    async fn handle_message(&self, message: Message, src_id: H256, from: SocketAddr) {
        match message {
            Message::Ping(ping) => {
                METRICS.message_requests_incoming.inc();
                self.handle_ping(ping, src_id, from).await;
            }
            Message::FindNode(find_node) => {
                METRICS.message_requests_incoming.inc();
                self.handle_find_node(find_node, src_id, from).await;
            }
            Message::TalkReq(talk_req) => {
                METRICS.message_requests_incoming.inc();
                self.handle_talk_req(talk_req, src_id, from).await;
            }
            Message::RegTopic(_) | Message::TopicQuery(_) => {
                // Topic advertisement is not implemented.
                METRICS.message_requests_incoming.inc();
                trace!(from = %src_id, kind = message.kind_name(), "Ignoring topic message");
            }
            Message::Pong(_) | Message::Nodes(_) | Message::TalkResp(_) | Message::Ticket(_) => {
                let solicited = self
                    .requests
                    .lock()
                    .await
                    .resolve_awaited(src_id, message);
                if !solicited {
                    METRICS.unsolicited_messages.inc();
                    trace!(from = %src_id, "Dropping unsolicited response");
                }
            }
        }
    }

    async fn handle_ping(&self, ping: PingMessage, src_id: H256, from: SocketAddr) {
        trace!(from = %src_id, enr_seq = ping.enr_seq, "Received PING");
        let pong = Message::Pong(PongMessage {
            req_id: ping.req_id,
            enr_seq: self.local_record.read().seq,
            recipient_ip: from.ip(),
            recipient_port: from.port(),
        });
        self.send_response(src_id, from, pong).await;
    }

    async fn handle_find_node(&self, find_node: FindNodeMessage, src_id: H256, from: SocketAddr) {
        let records: Vec<NodeRecord> = if find_node.distances == [0] {
            vec![self.local_record.read().clone()]
        } else {
            self.table
                .lock()
                .await
                .entries_at_distances(&find_node.distances, true, FIND_NODE_RESULT_LIMIT)
                .into_iter()
                .filter(|e| e.node.node_id() != src_id)
                .map(|e| e.record)
                .collect()
        };

        // The response spans ceil(n / MAX_NODES_PER_MESSAGE) messages, all
        // sharing the request id; an empty answer is still one message.
        let total = records.len().div_ceil(MAX_NODES_PER_MESSAGE).max(1) as u64;
        if records.is_empty() {
            let nodes = Message::Nodes(NodesMessage {
                req_id: find_node.req_id,
                total,
                nodes: vec![],
            });
            self.send_response(src_id, from, nodes).await;
            return;
        }
        for chunk in records.chunks(MAX_NODES_PER_MESSAGE) {
            let nodes = Message::Nodes(NodesMessage {
                req_id: find_node.req_id.clone(),
                total,
                nodes: chunk.to_vec(),
            });
            self.send_response(src_id, from, nodes).await;
        }
    }

    async fn handle_talk_req(&self, talk_req: TalkReqMessage, src_id: H256, from: SocketAddr) {
        let response = self.talk.handle(&talk_req.protocol, &talk_req.request);
        let resp = Message::TalkResp(TalkRespMessage {
            req_id: talk_req.req_id,
            response: Bytes::from(response),
        });
        self.send_response(src_id, from, resp).await;
    }

    // Background loops //

    /// Pings the stalest entry of a random bucket at a randomized cadence,
    /// feeding observed addresses into the external-address vote.
    async fn revalidation_loop(self) {
        loop {
            let max_wait = (self.config.revalidate_max.as_millis() as u64).max(1);
            let wait = Duration::from_millis(OsRng.gen_range(0..max_wait));
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = time::sleep(wait) => {}
            }

            let candidate = self.table.lock().await.node_to_revalidate(&mut OsRng);
            let Some(node) = candidate else { continue };
            match self.ping(&node).await {
                Ok(pong) => {
                    let id = node.node_id();
                    self.ip_votes
                        .lock()
                        .await
                        .insert(id, SocketAddr::new(pong.observed_ip, pong.observed_port));
                    let known_seq = self
                        .table
                        .lock()
                        .await
                        .get(&id)
                        .map(|e| e.record.seq)
                        .unwrap_or(0);
                    if pong.enr_seq > known_seq {
                        let _ = self.request_own_record(&node).await;
                    }
                }
                Err(e) => {
                    trace!(node = %node.node_id(), err = %e, "Revalidation ping failed");
                }
            }
        }
    }

    /// Populates the table at startup, then keeps it warm with a
    /// random-target query whenever no lookup ran for a full interval.
    async fn refresh_loop(self) {
        debug!("Starting table refresh");
        self.lookup(self.local_node.node_id()).await;
        for _ in 0..self.config.initial_lookups {
            if self.cancel.is_cancelled() {
                return;
            }
            self.query(random_target()).await;
        }
        let table_size = self.table.lock().await.len();
        debug!(table_size, "Initial lookups finished");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = time::sleep(self.config.refresh_interval) => {}
            }
            let idle_for = self.last_lookup.lock().await.elapsed();
            if idle_for >= self.config.refresh_interval {
                self.query(random_target()).await;
            }
        }
    }

    /// Re-signs the local record when a majority of peers report an external
    /// address that differs from the advertised one.
    async fn ip_majority_loop(self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = time::sleep(self.config.ip_majority_interval) => {}
            }
            let Some(majority) = self.ip_votes.lock().await.majority() else {
                continue;
            };
            let current = self.local_record.read().udp_addr();
            if current == Some(majority) {
                continue;
            }
            info!(voted = %majority, advertised = ?current, "External address vote differs");
            if !self.config.enr_auto_update {
                continue;
            }
            let result = self.local_record.write().set_udp_address(majority, &self.signer);
            match result {
                Ok(()) => {
                    METRICS.enr_auto_update.inc();
                    info!(addr = %majority, "Local record updated from address vote");
                }
                Err(e) => error!(err = %e, "Failed to re-sign local record"),
            }
        }
    }

    /// Sweeps expired pending requests and stale challenges.
    async fn housekeeping_loop(self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = time::sleep(HOUSEKEEPING_INTERVAL) => {}
            }
            let dropped = self
                .requests
                .lock()
                .await
                .prune_pending(self.config.response_timeout);
            if dropped > 0 {
                trace!(dropped, "Pruned expired pending requests");
            }
            let timeout = self.config.handshake_timeout;
            let now = Instant::now();
            self.challenges
                .lock()
                .await
                .retain(|_, challenge| now.duration_since(challenge.sent_at) < timeout);
        }
    }
}

pub(crate) fn new_req_id() -> Bytes {
    Bytes::from(OsRng.r#gen::<u64>().to_be_bytes().to_vec())
}

pub(crate) fn random_target() -> H256 {
    let mut target = [0u8; 32];
    OsRng.fill_bytes(&mut target);
    H256(target)
}
