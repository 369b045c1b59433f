use crate::rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use crate::utils::node_id;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::{BufMut, Bytes};
use ethereum_types::{H256, H264, H512};
use secp256k1::{PublicKey, SecretKey, ecdsa::Signature};
use serde::{Deserialize, Serialize, ser::Serializer};
use sha3::{Digest as _, Keccak256};
use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
    sync::OnceLock,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("RLP decode error: {0}")]
    RLPDecodeError(#[from] RLPDecodeError),
    #[error("Missing field: {0}")]
    MissingField(String),
    #[error("Signature error: {0}")]
    SignatureError(String),
}

const MAX_NODE_RECORD_ENCODED_SIZE: usize = 300;

/// A peer endpoint derived from a verified node record.
#[derive(Debug, Clone)]
pub struct Node {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub public_key: H512,
    node_id: OnceLock<H256>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.node_id() == other.node_id()
    }
}

impl Eq for Node {}

impl Node {
    pub fn new(ip: IpAddr, udp_port: u16, tcp_port: u16, public_key: H512) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
            public_key,
            node_id: OnceLock::new(),
        }
    }

    pub fn from_record(record: &NodeRecord) -> Result<Self, NodeError> {
        let pairs = record.pairs();
        let compressed = pairs.secp256k1.ok_or(NodeError::MissingField(
            "public key not found in record".into(),
        ))?;
        let public_key = PublicKey::from_slice(compressed.as_bytes())
            .map_err(|_| NodeError::ParseError("record carries an invalid public key".into()))?;
        let encoded = public_key.serialize_uncompressed();
        let public_key = H512::from_slice(&encoded[1..]);

        let ip: IpAddr = match (pairs.ip, pairs.ip6) {
            (None, None) => {
                return Err(NodeError::MissingField(
                    "no ip found in record, can't construct node".into(),
                ));
            }
            (None, Some(ipv6)) => IpAddr::from(ipv6),
            (Some(ipv4), _) => IpAddr::from(ipv4),
        };

        // Either port may be missing; default the absent one to the other.
        let udp_port = pairs
            .udp_port
            .or(pairs.tcp_port)
            .ok_or(NodeError::MissingField("no port found in record".into()))?;
        let tcp_port = pairs
            .tcp_port
            .or(pairs.udp_port)
            .ok_or(NodeError::MissingField("no port found in record".into()))?;

        Ok(Self::new(ip, udp_port, tcp_port, public_key))
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.to_canonical(), self.udp_port)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.to_canonical(), self.tcp_port)
    }

    pub fn node_id(&self) -> H256 {
        *self.node_id.get_or_init(|| node_id(&self.public_key))
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}({}:{})", self.node_id(), self.ip, self.udp_port)
    }
}

/// The key/value pairs of a node record.
///
/// Only the pairs of the "v4" identity scheme are decoded; unknown keys are
/// ignored on decode and never re-encoded.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct NodeRecordPairs {
    /// Identity scheme of the record, always "v4".
    pub id: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub ip6: Option<Ipv6Addr>,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    /// Compressed secp256k1 public key, 33 bytes.
    pub secp256k1: Option<H264>,
}

impl NodeRecordPairs {
    fn try_from_raw_pairs(pairs: &[(Bytes, Bytes)]) -> Result<NodeRecordPairs, RLPDecodeError> {
        let mut decoded = NodeRecordPairs::default();
        for (key, value) in pairs {
            match key.as_ref() {
                b"id" => decoded.id = Some(String::decode(value)?),
                b"ip" => decoded.ip = Some(Ipv4Addr::decode(value)?),
                b"ip6" => decoded.ip6 = Some(Ipv6Addr::decode(value)?),
                b"tcp" => decoded.tcp_port = Some(u16::decode(value)?),
                b"udp" => decoded.udp_port = Some(u16::decode(value)?),
                b"secp256k1" => decoded.secp256k1 = Some(H264(<[u8; 33]>::decode(value)?)),
                // Unknown keys are allowed and skipped.
                _ => {}
            }
        }
        Ok(decoded)
    }

    /// Encodes the pairs as `key || value` items, keys in sorted order as the
    /// record format requires.
    fn encode(&self, buf: &mut dyn BufMut) {
        if let Some(id) = &self.id {
            Bytes::from("id").encode(buf);
            id.encode(buf);
        }
        if let Some(ip) = &self.ip {
            Bytes::from("ip").encode(buf);
            ip.encode(buf);
        }
        if let Some(ip6) = &self.ip6 {
            Bytes::from("ip6").encode(buf);
            ip6.encode(buf);
        }
        if let Some(secp256k1) = &self.secp256k1 {
            Bytes::from("secp256k1").encode(buf);
            secp256k1.encode(buf);
        }
        if let Some(tcp) = self.tcp_port {
            Bytes::from("tcp").encode(buf);
            tcp.encode(buf);
        }
        if let Some(udp) = self.udp_port {
            Bytes::from("udp").encode(buf);
            udp.encode(buf);
        }
    }
}

/// A signed, versioned identity document for a node: its public key plus
/// address hints, with a sequence number bumped on every change.
#[derive(Debug, PartialEq, Clone, Eq, Default)]
pub struct NodeRecord {
    pub signature: H512,
    pub seq: u64,
    pairs: NodeRecordPairs,
}

impl NodeRecord {
    pub fn from_node(node: &Node, seq: u64, signer: &SecretKey) -> Result<Self, NodeError> {
        let mut pairs = NodeRecordPairs {
            id: Some("v4".to_string()),
            secp256k1: Some(H264::from_slice(
                &PublicKey::from_secret_key(secp256k1::SECP256K1, signer).serialize(),
            )),
            tcp_port: Some(node.tcp_port),
            udp_port: Some(node.udp_port),
            ..Default::default()
        };
        match node.ip.to_canonical() {
            IpAddr::V4(ip) => pairs.ip = Some(ip),
            IpAddr::V6(ip) => pairs.ip6 = Some(ip),
        }

        let mut record = NodeRecord {
            seq,
            pairs,
            ..Default::default()
        };
        record.signature = record.sign_record(signer)?;
        Ok(record)
    }

    /// Replaces the advertised UDP endpoint, bumping the sequence number and
    /// re-signing the record.
    pub fn set_udp_address(
        &mut self,
        addr: SocketAddr,
        signer: &SecretKey,
    ) -> Result<(), NodeError> {
        match addr.ip().to_canonical() {
            IpAddr::V4(ip) => {
                self.pairs.ip = Some(ip);
                self.pairs.ip6 = None;
            }
            IpAddr::V6(ip) => {
                self.pairs.ip6 = Some(ip);
                self.pairs.ip = None;
            }
        }
        self.pairs.udp_port = Some(addr.port());
        self.seq += 1;
        self.signature = self.sign_record(signer)?;
        Ok(())
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = match (self.pairs.ip, self.pairs.ip6) {
            (Some(ip), _) => ip.into(),
            (None, Some(ip6)) => ip6.into(),
            (None, None) => return None,
        };
        Some(SocketAddr::new(ip, self.pairs.udp_port?))
    }

    pub fn enr_url(&self) -> String {
        let rlp_encoded = self.encode_to_vec();
        format!("enr:{}", URL_SAFE_NO_PAD.encode(rlp_encoded))
    }

    fn sign_record(&self, signer: &SecretKey) -> Result<H512, NodeError> {
        let digest = self.signature_digest();
        let msg = secp256k1::Message::from_digest_slice(&digest)
            .map_err(|_| NodeError::SignatureError("invalid message digest".into()))?;
        let (_recovery_id, signature_bytes) = secp256k1::SECP256K1
            .sign_ecdsa_recoverable(&msg, signer)
            .serialize_compact();
        Ok(H512::from_slice(&signature_bytes))
    }

    /// Keccak digest of `[seq, k, v, ...]`, the content the signature covers.
    pub fn signature_digest(&self) -> [u8; 32] {
        let mut rlp = vec![];
        Encoder::new(&mut rlp)
            .encode_field(&self.seq)
            .encode_with(|buf| self.pairs.encode(buf))
            .finish();
        Keccak256::digest(&rlp).into()
    }

    /// Verifies the record signature against the embedded public key.
    pub fn verify_signature(&self) -> bool {
        let Some(pubkey_bytes) = self.pairs.secp256k1 else {
            return false;
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes.as_bytes()) else {
            return false;
        };
        let digest = self.signature_digest();
        let Ok(message) = secp256k1::Message::from_digest_slice(&digest) else {
            return false;
        };
        let Ok(signature) = Signature::from_compact(self.signature.as_bytes()) else {
            return false;
        };
        secp256k1::SECP256K1
            .verify_ecdsa(&message, &signature, &pubkey)
            .is_ok()
    }

    pub fn pairs(&self) -> &NodeRecordPairs {
        &self.pairs
    }
}

impl FromStr for NodeRecord {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s
            .strip_prefix("enr:")
            .ok_or(NodeError::InvalidFormat("missing enr: prefix".into()))?;
        let decoded = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| NodeError::ParseError(format!("invalid base64: {e}")))?;
        Ok(NodeRecord::decode(&decoded)?)
    }
}

impl Display for NodeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.enr_url())
    }
}

impl Serialize for NodeRecord {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.enr_url())
    }
}

impl<'de> Deserialize<'de> for NodeRecord {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        NodeRecord::from_str(&<String>::deserialize(deserializer)?)
            .map_err(|e| serde::de::Error::custom(format!("{e}")))
    }
}

impl RLPEncode for NodeRecord {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.signature)
            .encode_field(&self.seq)
            .encode_with(|buf| self.pairs.encode(buf))
            .finish();
    }

    fn length(&self) -> usize {
        self.encode_to_vec().len()
    }
}

impl RLPDecode for NodeRecord {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        if decoder.payload_len() > MAX_NODE_RECORD_ENCODED_SIZE {
            return Err(RLPDecodeError::InvalidLength);
        }
        let (signature, decoder) = decoder.decode_field("signature")?;
        let (seq, decoder) = decoder.decode_field("seq")?;
        let (raw_pairs, decoder) = decode_raw_pairs(vec![], decoder)?;

        // All pairs are optional except the identity scheme.
        if !raw_pairs.iter().any(|(k, _)| k.as_ref() == b"id") {
            return Err(RLPDecodeError::Custom(
                "invalid node record, 'id' pair missing".into(),
            ));
        }
        let pairs = NodeRecordPairs::try_from_raw_pairs(&raw_pairs)?;
        let record = NodeRecord {
            signature,
            seq,
            pairs,
        };
        Ok((record, decoder.finish()?))
    }
}

/// Collects the remaining `key || value` items of a record body. Values are
/// kept as raw RLP so each can be decoded as its own type.
fn decode_raw_pairs<'a>(
    mut pairs: Vec<(Bytes, Bytes)>,
    decoder: Decoder<'a>,
) -> Result<(Vec<(Bytes, Bytes)>, Decoder<'a>), RLPDecodeError> {
    let (key, decoder): (Option<Bytes>, Decoder<'a>) = decoder.decode_optional_field();
    let Some(key) = key else {
        return Ok((pairs, decoder));
    };
    let (value, decoder) = decoder.get_encoded_item()?;
    pairs.push((key, Bytes::from(value)));
    decode_raw_pairs(pairs, decoder)
}
