use std::{array::TryFromSliceError, fmt::Display, net::IpAddr};

use aes::cipher::{KeyIvInit, StreamCipher, StreamCipherError};
use aes_gcm::{Aes128Gcm, KeyInit, aead::AeadMutInPlace};
use bytes::{BufMut, Bytes};
use ethereum_types::H256;
use rand::RngCore;

use crate::rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use crate::types::NodeRecord;

type Aes128Ctr64BE = ctr::Ctr64BE<aes::Aes128>;

// Packet size bounds; a datagram outside them is dropped before any
// cryptography runs.
const MIN_PACKET_SIZE: usize = 63;
const MAX_PACKET_SIZE: usize = 1280;
/// 32 src-id + 1 sig-size + 1 eph-key-size
const HANDSHAKE_AUTHDATA_HEAD: usize = 34;
const PROTOCOL_ID: &[u8] = b"discv5";
const PROTOCOL_VERSION: u16 = 0x0001;
/// masking-iv size
const IV_MASKING_SIZE: usize = 16;
/// Unmasked header: protocol-id(6) || version(2) || flag(1) || nonce(12) || authdata-size(2)
const STATIC_HEADER_SIZE: usize = 23;
const STATIC_HEADER_END: usize = IV_MASKING_SIZE + STATIC_HEADER_SIZE;
/// Size of the random payload carried by a session-less request packet.
pub const RANDOM_PACKET_DATA_SIZE: usize = 44;

pub const ORDINARY_FLAG: u8 = 0x00;
pub const WHO_ARE_YOU_FLAG: u8 = 0x01;
pub const HANDSHAKE_FLAG: u8 = 0x02;

#[derive(Debug, thiserror::Error)]
pub enum PacketCodecError {
    #[error("RLP decoding error")]
    RLPDecodeError(#[from] RLPDecodeError),
    #[error("Invalid packet size")]
    InvalidSize,
    #[error("Invalid protocol: {0}")]
    InvalidProtocol(String),
    #[error("Stream cipher error: {0}")]
    CipherError(String),
    #[error("AEAD open failed")]
    OpenFailed,
    #[error("TryFromSliceError: {0}")]
    TryFromSliceError(#[from] TryFromSliceError),
    #[error("Io Error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<StreamCipherError> for PacketCodecError {
    fn from(error: StreamCipherError) -> Self {
        PacketCodecError::CipherError(error.to_string())
    }
}

/// Unmasked packet header shared by every flavor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub static_header: Vec<u8>,
    pub flag: u8,
    pub nonce: [u8; 12],
    pub authdata: Vec<u8>,
}

/// A datagram after unmasking the header but before opening the message.
///
/// The message stays encrypted here because the read key depends on protocol
/// state (the session store) the codec has no business knowing about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketEnvelope {
    pub masking_iv: [u8; 16],
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl PacketEnvelope {
    pub fn decode(dest_id: &H256, encoded_packet: &[u8]) -> Result<Self, PacketCodecError> {
        if encoded_packet.len() < MIN_PACKET_SIZE || encoded_packet.len() > MAX_PACKET_SIZE {
            return Err(PacketCodecError::InvalidSize);
        }

        // packet = masking-iv || masked-header || message
        let masking_iv: [u8; 16] = encoded_packet[..IV_MASKING_SIZE].try_into()?;

        let mut cipher = <Aes128Ctr64BE as KeyIvInit>::new(
            dest_id.as_bytes()[..16].into(),
            masking_iv[..].into(),
        );

        let mut static_header = encoded_packet[IV_MASKING_SIZE..STATIC_HEADER_END].to_vec();
        cipher.try_apply_keystream(&mut static_header)?;

        // static-header = protocol-id || version || flag || nonce || authdata-size
        let protocol_id = &static_header[..6];
        let version = u16::from_be_bytes(static_header[6..8].try_into()?);
        if protocol_id != PROTOCOL_ID || version != PROTOCOL_VERSION {
            return Err(PacketCodecError::InvalidProtocol(
                match str::from_utf8(protocol_id) {
                    Ok(id) => format!("{id} v{version}"),
                    Err(_) => format!("{protocol_id:?} v{version}"),
                },
            ));
        }

        let flag = static_header[8];
        let nonce: [u8; 12] = static_header[9..21].try_into()?;
        let authdata_size = u16::from_be_bytes(static_header[21..23].try_into()?) as usize;
        let authdata_end = STATIC_HEADER_END + authdata_size;
        if encoded_packet.len() < authdata_end {
            return Err(PacketCodecError::InvalidSize);
        }

        let mut authdata = encoded_packet[STATIC_HEADER_END..authdata_end].to_vec();
        cipher.try_apply_keystream(&mut authdata)?;

        Ok(PacketEnvelope {
            masking_iv,
            header: PacketHeader {
                static_header,
                flag,
                nonce,
                authdata,
            },
            payload: encoded_packet[authdata_end..].to_vec(),
        })
    }

    /// challenge-data = masking-iv || static-header || authdata, the exact
    /// bytes a handshake signature and key derivation bind to.
    pub fn challenge_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(
            self.masking_iv.len() + self.header.static_header.len() + self.header.authdata.len(),
        );
        data.extend_from_slice(&self.masking_iv);
        data.extend_from_slice(&self.header.static_header);
        data.extend_from_slice(&self.header.authdata);
        data
    }
}

fn static_header(flag: u8, nonce: &[u8; 12], authdata_size: u16) -> Vec<u8> {
    let mut header = Vec::with_capacity(STATIC_HEADER_SIZE);
    header.put_slice(PROTOCOL_ID);
    header.put_slice(&PROTOCOL_VERSION.to_be_bytes());
    header.put_u8(flag);
    header.put_slice(nonce);
    header.put_slice(&authdata_size.to_be_bytes());
    header
}

/// Masks the header in place and assembles the full packet into `buf`.
fn write_masked(
    buf: &mut dyn BufMut,
    dest_id: &H256,
    masking_iv: [u8; 16],
    mut static_header: Vec<u8>,
    mut authdata: Vec<u8>,
    payload: &[u8],
) -> Result<(), PacketCodecError> {
    buf.put_slice(&masking_iv);
    let mut cipher = <Aes128Ctr64BE as KeyIvInit>::new(
        dest_id.as_bytes()[..16].into(),
        masking_iv[..].into(),
    );
    cipher.try_apply_keystream(&mut static_header)?;
    buf.put_slice(&static_header);
    cipher.try_apply_keystream(&mut authdata)?;
    buf.put_slice(&authdata);
    buf.put_slice(payload);
    Ok(())
}

fn aead_seal(
    key: &[u8; 16],
    nonce: &[u8; 12],
    ad: &[u8],
    plaintext: Vec<u8>,
) -> Result<Vec<u8>, PacketCodecError> {
    let mut cipher = Aes128Gcm::new(key.into());
    let mut buf = plaintext;
    cipher
        .encrypt_in_place(nonce.into(), ad, &mut buf)
        .map_err(|e| PacketCodecError::CipherError(e.to_string()))?;
    Ok(buf)
}

fn aead_open(
    key: &[u8; 16],
    nonce: &[u8; 12],
    ad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, PacketCodecError> {
    let mut cipher = Aes128Gcm::new(key.into());
    let mut buf = ciphertext.to_vec();
    cipher
        .decrypt_in_place(nonce.into(), ad, &mut buf)
        .map_err(|_| PacketCodecError::OpenFailed)?;
    Ok(buf)
}

/// An authenticated-encrypted message packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ordinary {
    pub src_id: H256,
    pub message: Message,
}

impl Ordinary {
    pub fn encode(
        &self,
        buf: &mut dyn BufMut,
        masking_iv: u128,
        nonce: &[u8; 12],
        dest_id: &H256,
        write_key: &[u8; 16],
    ) -> Result<(), PacketCodecError> {
        let authdata = self.src_id.as_bytes().to_vec();
        let static_header = static_header(ORDINARY_FLAG, nonce, authdata.len() as u16);

        let mut message = Vec::new();
        self.message.encode(&mut message);

        // message-ad = masking-iv || static-header || authdata
        let masking_iv = masking_iv.to_be_bytes();
        let mut message_ad = masking_iv.to_vec();
        message_ad.extend_from_slice(&static_header);
        message_ad.extend_from_slice(&authdata);
        let sealed = aead_seal(write_key, nonce, &message_ad, message)?;

        write_masked(buf, dest_id, masking_iv, static_header, authdata, &sealed)
    }

    pub fn decode(
        envelope: &PacketEnvelope,
        read_key: &[u8; 16],
    ) -> Result<Ordinary, PacketCodecError> {
        if envelope.header.authdata.len() != 32 {
            return Err(PacketCodecError::InvalidSize);
        }
        let src_id = H256::from_slice(&envelope.header.authdata);
        let message_ad = envelope.challenge_data();
        let message = aead_open(read_key, &envelope.header.nonce, &message_ad, &envelope.payload)?;
        let message = Message::decode(&message)?;
        Ok(Ordinary { src_id, message })
    }
}

/// Encodes a session-less request packet: ordinary shape, random payload.
/// The recipient cannot decrypt it and answers with a WHOAREYOU challenge.
pub fn encode_random_packet<R: RngCore>(
    buf: &mut dyn BufMut,
    rng: &mut R,
    masking_iv: u128,
    nonce: &[u8; 12],
    src_id: &H256,
    dest_id: &H256,
) -> Result<(), PacketCodecError> {
    let authdata = src_id.as_bytes().to_vec();
    let static_header = static_header(ORDINARY_FLAG, nonce, authdata.len() as u16);
    let mut payload = vec![0u8; RANDOM_PACKET_DATA_SIZE];
    rng.fill_bytes(&mut payload);
    write_masked(
        buf,
        dest_id,
        masking_iv.to_be_bytes(),
        static_header,
        authdata,
        &payload,
    )
}

/// The cleartext challenge issued against a packet that could not be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoAreYou {
    pub id_nonce: [u8; 16],
    pub enr_seq: u64,
}

impl WhoAreYou {
    /// Encodes the challenge packet. `request_nonce` is the nonce of the
    /// packet being challenged. Returns the wire bytes together with the
    /// challenge-data the eventual handshake binds to.
    pub fn encode(
        &self,
        request_nonce: &[u8; 12],
        masking_iv: u128,
        dest_id: &H256,
    ) -> Result<(Vec<u8>, Vec<u8>), PacketCodecError> {
        let mut authdata = Vec::with_capacity(24);
        authdata.put_slice(&self.id_nonce);
        authdata.put_slice(&self.enr_seq.to_be_bytes());
        let static_header = static_header(WHO_ARE_YOU_FLAG, request_nonce, authdata.len() as u16);

        let masking_iv = masking_iv.to_be_bytes();
        let mut challenge_data = masking_iv.to_vec();
        challenge_data.extend_from_slice(&static_header);
        challenge_data.extend_from_slice(&authdata);

        let mut buf = Vec::new();
        write_masked(&mut buf, dest_id, masking_iv, static_header, authdata, &[])?;
        Ok((buf, challenge_data))
    }

    pub fn decode(envelope: &PacketEnvelope) -> Result<WhoAreYou, PacketCodecError> {
        let authdata = &envelope.header.authdata;
        if authdata.len() != 24 {
            return Err(PacketCodecError::InvalidSize);
        }
        Ok(WhoAreYou {
            id_nonce: authdata[..16].try_into()?,
            enr_seq: u64::from_be_bytes(authdata[16..].try_into()?),
        })
    }
}

/// The challenge response: id signature, ephemeral key, optionally the
/// sender's record, and the original message sealed under the fresh keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub src_id: H256,
    pub id_signature: Vec<u8>,
    pub eph_pubkey: Vec<u8>,
    /// Omitted when the challenge already named our current record seq.
    pub record: Option<NodeRecord>,
    pub message: Message,
}

impl Handshake {
    fn encode_authdata(&self, buf: &mut dyn BufMut) -> Result<(), PacketCodecError> {
        let sig_size: u8 = self
            .id_signature
            .len()
            .try_into()
            .map_err(|_| PacketCodecError::InvalidSize)?;
        let eph_key_size: u8 = self
            .eph_pubkey
            .len()
            .try_into()
            .map_err(|_| PacketCodecError::InvalidSize)?;

        buf.put_slice(self.src_id.as_bytes());
        buf.put_u8(sig_size);
        buf.put_u8(eph_key_size);
        buf.put_slice(&self.id_signature);
        buf.put_slice(&self.eph_pubkey);
        if let Some(record) = &self.record {
            record.encode(buf);
        }
        Ok(())
    }

    pub fn encode(
        &self,
        buf: &mut dyn BufMut,
        masking_iv: u128,
        nonce: &[u8; 12],
        dest_id: &H256,
        write_key: &[u8; 16],
    ) -> Result<(), PacketCodecError> {
        let mut authdata = Vec::new();
        self.encode_authdata(&mut authdata)?;
        let authdata_size =
            u16::try_from(authdata.len()).map_err(|_| PacketCodecError::InvalidSize)?;
        let static_header = static_header(HANDSHAKE_FLAG, nonce, authdata_size);

        let mut message = Vec::new();
        self.message.encode(&mut message);

        let masking_iv = masking_iv.to_be_bytes();
        let mut message_ad = masking_iv.to_vec();
        message_ad.extend_from_slice(&static_header);
        message_ad.extend_from_slice(&authdata);
        let sealed = aead_seal(write_key, nonce, &message_ad, message)?;

        write_masked(buf, dest_id, masking_iv, static_header, authdata, &sealed)
    }

    pub fn decode(
        envelope: &PacketEnvelope,
        read_key: &[u8; 16],
    ) -> Result<Handshake, PacketCodecError> {
        let authdata = HandshakeAuthdata::decode(envelope)?;
        let message = Self::open_message(envelope, read_key)?;
        Ok(Handshake {
            src_id: authdata.src_id,
            id_signature: authdata.id_signature,
            eph_pubkey: authdata.eph_pubkey,
            record: authdata.record,
            message,
        })
    }

    /// Opens the sealed message once the session read key is known.
    pub fn open_message(
        envelope: &PacketEnvelope,
        read_key: &[u8; 16],
    ) -> Result<Message, PacketCodecError> {
        let message_ad = envelope.challenge_data();
        let message = aead_open(read_key, &envelope.header.nonce, &message_ad, &envelope.payload)?;
        Ok(Message::decode(&message)?)
    }
}

/// The handshake authdata alone. The server parses this first: it needs the
/// ephemeral key and signature before it can derive the read key that opens
/// the sealed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeAuthdata {
    pub src_id: H256,
    pub id_signature: Vec<u8>,
    pub eph_pubkey: Vec<u8>,
    pub record: Option<NodeRecord>,
}

impl HandshakeAuthdata {
    pub fn decode(envelope: &PacketEnvelope) -> Result<Self, PacketCodecError> {
        let authdata = &envelope.header.authdata;
        if authdata.len() < HANDSHAKE_AUTHDATA_HEAD {
            return Err(PacketCodecError::InvalidSize);
        }
        let src_id = H256::from_slice(&authdata[..32]);
        let sig_size = authdata[32] as usize;
        let eph_key_size = authdata[33] as usize;
        let authdata_head = HANDSHAKE_AUTHDATA_HEAD + sig_size + eph_key_size;
        if authdata.len() < authdata_head {
            return Err(PacketCodecError::InvalidSize);
        }
        let id_signature =
            authdata[HANDSHAKE_AUTHDATA_HEAD..HANDSHAKE_AUTHDATA_HEAD + sig_size].to_vec();
        let eph_pubkey = authdata[HANDSHAKE_AUTHDATA_HEAD + sig_size..authdata_head].to_vec();
        let record = if authdata.len() > authdata_head {
            Some(NodeRecord::decode(&authdata[authdata_head..])?)
        } else {
            None
        };
        Ok(Self {
            src_id,
            id_signature,
            eph_pubkey,
            record,
        })
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Message {
    Ping(PingMessage),
    Pong(PongMessage),
    FindNode(FindNodeMessage),
    Nodes(NodesMessage),
    TalkReq(TalkReqMessage),
    TalkResp(TalkRespMessage),
    RegTopic(RegTopicMessage),
    Ticket(TicketMessage),
    TopicQuery(TopicQueryMessage),
}

impl Message {
    fn msg_type(&self) -> u8 {
        match self {
            Message::Ping(_) => 0x01,
            Message::Pong(_) => 0x02,
            Message::FindNode(_) => 0x03,
            Message::Nodes(_) => 0x04,
            Message::TalkReq(_) => 0x05,
            Message::TalkResp(_) => 0x06,
            Message::RegTopic(_) => 0x07,
            Message::Ticket(_) => 0x08,
            Message::TopicQuery(_) => 0x0a,
        }
    }

    pub fn req_id(&self) -> &Bytes {
        match self {
            Message::Ping(m) => &m.req_id,
            Message::Pong(m) => &m.req_id,
            Message::FindNode(m) => &m.req_id,
            Message::Nodes(m) => &m.req_id,
            Message::TalkReq(m) => &m.req_id,
            Message::TalkResp(m) => &m.req_id,
            Message::RegTopic(m) => &m.req_id,
            Message::Ticket(m) => &m.req_id,
            Message::TopicQuery(m) => &m.req_id,
        }
    }

    pub fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_u8(self.msg_type());
        match self {
            Message::Ping(m) => m.encode(buf),
            Message::Pong(m) => m.encode(buf),
            Message::FindNode(m) => m.encode(buf),
            Message::Nodes(m) => m.encode(buf),
            Message::TalkReq(m) => m.encode(buf),
            Message::TalkResp(m) => m.encode(buf),
            Message::RegTopic(m) => m.encode(buf),
            Message::Ticket(m) => m.encode(buf),
            Message::TopicQuery(m) => m.encode(buf),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, RLPDecodeError> {
        let (message_type, body) = bytes
            .split_first()
            .ok_or(RLPDecodeError::InvalidLength)?;
        match *message_type {
            0x01 => Ok(Message::Ping(PingMessage::decode(body)?)),
            0x02 => Ok(Message::Pong(PongMessage::decode(body)?)),
            0x03 => Ok(Message::FindNode(FindNodeMessage::decode(body)?)),
            0x04 => Ok(Message::Nodes(NodesMessage::decode(body)?)),
            0x05 => Ok(Message::TalkReq(TalkReqMessage::decode(body)?)),
            0x06 => Ok(Message::TalkResp(TalkRespMessage::decode(body)?)),
            0x07 => Ok(Message::RegTopic(RegTopicMessage::decode(body)?)),
            0x08 => Ok(Message::Ticket(TicketMessage::decode(body)?)),
            0x0a => Ok(Message::TopicQuery(TopicQueryMessage::decode(body)?)),
            _ => Err(RLPDecodeError::MalformedData),
        }
    }

    pub const fn kind_name(&self) -> &'static str {
        match self {
            Message::Ping(_) => "PING",
            Message::Pong(_) => "PONG",
            Message::FindNode(_) => "FINDNODE",
            Message::Nodes(_) => "NODES",
            Message::TalkReq(_) => "TALKREQ",
            Message::TalkResp(_) => "TALKRESP",
            Message::RegTopic(_) => "REGTOPIC",
            Message::Ticket(_) => "TICKET",
            Message::TopicQuery(_) => "TOPICQUERY",
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingMessage {
    pub req_id: Bytes,
    /// The sender's record sequence number.
    pub enr_seq: u64,
}

impl RLPEncode for PingMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.req_id)
            .encode_field(&self.enr_seq)
            .finish();
    }

    fn length(&self) -> usize {
        self.encode_to_vec().len()
    }
}

impl RLPDecode for PingMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (req_id, decoder) = decoder.decode_field("req_id")?;
        let (enr_seq, decoder) = decoder.decode_field("enr_seq")?;
        Ok((Self { req_id, enr_seq }, decoder.finish()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PongMessage {
    pub req_id: Bytes,
    pub enr_seq: u64,
    /// The sender's UDP endpoint as observed by the responder.
    pub recipient_ip: IpAddr,
    pub recipient_port: u16,
}

impl RLPEncode for PongMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.req_id)
            .encode_field(&self.enr_seq)
            .encode_field(&self.recipient_ip)
            .encode_field(&self.recipient_port)
            .finish();
    }

    fn length(&self) -> usize {
        self.encode_to_vec().len()
    }
}

impl RLPDecode for PongMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (req_id, decoder) = decoder.decode_field("req_id")?;
        let (enr_seq, decoder) = decoder.decode_field("enr_seq")?;
        let (recipient_ip, decoder) = decoder.decode_field("recipient_ip")?;
        let (recipient_port, decoder) = decoder.decode_field("recipient_port")?;
        Ok((
            Self {
                req_id,
                enr_seq,
                recipient_ip,
                recipient_port,
            },
            decoder.finish()?,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodeMessage {
    pub req_id: Bytes,
    pub distances: Vec<u64>,
}

impl RLPEncode for FindNodeMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.req_id)
            .encode_field(&self.distances)
            .finish();
    }

    fn length(&self) -> usize {
        self.encode_to_vec().len()
    }
}

impl RLPDecode for FindNodeMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (req_id, decoder) = decoder.decode_field("req_id")?;
        let (distances, decoder) = decoder.decode_field("distances")?;
        Ok((Self { req_id, distances }, decoder.finish()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodesMessage {
    pub req_id: Bytes,
    /// Number of messages the full response spans.
    pub total: u64,
    pub nodes: Vec<NodeRecord>,
}

impl RLPEncode for NodesMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.req_id)
            .encode_field(&self.total)
            .encode_field(&self.nodes)
            .finish();
    }

    fn length(&self) -> usize {
        self.encode_to_vec().len()
    }
}

impl RLPDecode for NodesMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (req_id, decoder) = decoder.decode_field("req_id")?;
        let (total, decoder) = decoder.decode_field("total")?;
        let (nodes, decoder) = decoder.decode_field("nodes")?;
        Ok((
            Self {
                req_id,
                total,
                nodes,
            },
            decoder.finish()?,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalkReqMessage {
    pub req_id: Bytes,
    pub protocol: Bytes,
    pub request: Bytes,
}

impl RLPEncode for TalkReqMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.req_id)
            .encode_field(&self.protocol)
            .encode_field(&self.request)
            .finish();
    }

    fn length(&self) -> usize {
        self.encode_to_vec().len()
    }
}

impl RLPDecode for TalkReqMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (req_id, decoder) = decoder.decode_field("req_id")?;
        let (protocol, decoder) = decoder.decode_field("protocol")?;
        let (request, decoder) = decoder.decode_field("request")?;
        Ok((
            Self {
                req_id,
                protocol,
                request,
            },
            decoder.finish()?,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalkRespMessage {
    pub req_id: Bytes,
    pub response: Bytes,
}

impl RLPEncode for TalkRespMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.req_id)
            .encode_field(&self.response)
            .finish();
    }

    fn length(&self) -> usize {
        self.encode_to_vec().len()
    }
}

impl RLPDecode for TalkRespMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (req_id, decoder) = decoder.decode_field("req_id")?;
        let (response, decoder) = decoder.decode_field("response")?;
        Ok((Self { req_id, response }, decoder.finish()?))
    }
}

/// Topic registration request. Accepted for wire compatibility, counted and
/// otherwise ignored; anything after the topic is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegTopicMessage {
    pub req_id: Bytes,
    pub topic: Bytes,
}

impl RLPEncode for RegTopicMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.req_id)
            .encode_field(&self.topic)
            .finish();
    }

    fn length(&self) -> usize {
        self.encode_to_vec().len()
    }
}

impl RLPDecode for RegTopicMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (req_id, decoder) = decoder.decode_field("req_id")?;
        let (topic, decoder) = decoder.decode_field("topic")?;
        Ok((Self { req_id, topic }, decoder.finish_unchecked()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketMessage {
    pub req_id: Bytes,
    pub ticket: Bytes,
    pub wait_time: u64,
}

impl RLPEncode for TicketMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.req_id)
            .encode_field(&self.ticket)
            .encode_field(&self.wait_time)
            .finish();
    }

    fn length(&self) -> usize {
        self.encode_to_vec().len()
    }
}

impl RLPDecode for TicketMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (req_id, decoder) = decoder.decode_field("req_id")?;
        let (ticket, decoder) = decoder.decode_field("ticket")?;
        let (wait_time, decoder) = decoder.decode_field("wait_time")?;
        Ok((
            Self {
                req_id,
                ticket,
                wait_time,
            },
            decoder.finish()?,
        ))
    }
}

/// Topic query. Accepted for wire compatibility, counted and ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicQueryMessage {
    pub req_id: Bytes,
    pub topic: Bytes,
}

impl RLPEncode for TopicQueryMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.req_id)
            .encode_field(&self.topic)
            .finish();
    }

    fn length(&self) -> usize {
        self.encode_to_vec().len()
    }
}

impl RLPDecode for TopicQueryMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (req_id, decoder) = decoder.decode_field("req_id")?;
        let (topic, decoder) = decoder.decode_field("topic")?;
        Ok((Self { req_id, topic }, decoder.finish_unchecked()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{node_id, public_key_from_signing_key};
    use hex_literal::hex;
    use secp256k1::SecretKey;

    fn node_b_id() -> H256 {
        let node_b_key = SecretKey::from_slice(&hex!(
            "66fb62bfbd66b9177a138c1e5cddbe4f7c30c343e94e68df8769459cb1cde628"
        ))
        .unwrap();
        node_id(&public_key_from_signing_key(&node_b_key))
    }

    #[test]
    fn aes_gcm_vector() {
        // https://github.com/ethereum/devp2p/blob/master/discv5/discv5-wire-test-vectors.md#encryptiondecryption
        let key = hex!("9f2d77db7004bf8a1a85107ac686990b");
        let nonce = hex!("27b5af763c446acd2749fe8e");
        let ad = hex!("93a7400fa0d6a694ebc24d5cf570f65d04215b6ac00757875e3f3a5f42107903");
        let pt = hex!("01c20101").to_vec();

        let sealed = aead_seal(&key, &nonce, &ad, pt.clone()).unwrap();
        assert_eq!(sealed, hex!("a5d12a2d94b8ccb3ba55558229867dc13bfa3648").to_vec());
        assert_eq!(aead_open(&key, &nonce, &ad, &sealed).unwrap(), pt);
    }

    #[test]
    fn ordinary_ping_packet_vector_roundtrip() {
        // Ping message packet (flag 0) from
        // https://github.com/ethereum/devp2p/blob/master/discv5/discv5-wire-test-vectors.md
        let dest_id = node_b_id();
        let encoded = &hex!(
            "00000000000000000000000000000000088b3d4342774649325f313964a39e55ea96c005ad52be8c7560413a7008f16c9e6d2f43bbea8814a546b7409ce783d34c4f53245d08dab84102ed931f66d1492acb308fa1c6715b9d139b81acbdcc"
        );
        let read_key = [0u8; 16];

        let envelope = PacketEnvelope::decode(&dest_id, encoded).unwrap();
        assert_eq!(envelope.header.flag, ORDINARY_FLAG);
        let ordinary = Ordinary::decode(&envelope, &read_key).unwrap();

        let expected = Ordinary {
            src_id: H256::from_slice(&hex!(
                "aaaa8419e9f49d0083561b48287df592939a8d19947d8c0ef88f2a4856a69fbb"
            )),
            message: Message::Ping(PingMessage {
                req_id: Bytes::copy_from_slice(&hex!("00000001")),
                enr_seq: 2,
            }),
        };
        assert_eq!(ordinary, expected);

        let masking_iv = u128::from_be_bytes(encoded[..16].try_into().unwrap());
        let nonce = envelope.header.nonce;
        let mut buf = Vec::new();
        ordinary
            .encode(&mut buf, masking_iv, &nonce, &dest_id, &read_key)
            .unwrap();
        assert_eq!(buf, encoded.to_vec());
    }

    #[test]
    fn whoareyou_packet_vector_roundtrip() {
        // WHOAREYOU packet (flag 1) from
        // https://github.com/ethereum/devp2p/blob/master/discv5/discv5-wire-test-vectors.md
        let dest_id = node_b_id();
        let expected = &hex!(
            "00000000000000000000000000000000088b3d434277464933a1ccc59f5967ad1d6035f15e528627dde75cd68292f9e6c27d6b66c8100a873fcbaed4e16b8d"
        );

        let whoareyou = WhoAreYou {
            id_nonce: hex!("0102030405060708090a0b0c0d0e0f10"),
            enr_seq: 0,
        };
        let request_nonce = hex!("0102030405060708090a0b0c");
        let (wire, challenge_data) = whoareyou.encode(&request_nonce, 0, &dest_id).unwrap();
        assert_eq!(wire, expected.to_vec());
        assert_eq!(
            challenge_data,
            hex!(
                "000000000000000000000000000000006469736376350001010102030405060708090a0b0c00180102030405060708090a0b0c0d0e0f100000000000000000"
            )
            .to_vec()
        );

        let envelope = PacketEnvelope::decode(&dest_id, expected).unwrap();
        assert_eq!(envelope.header.flag, WHO_ARE_YOU_FLAG);
        assert_eq!(envelope.header.nonce, request_nonce);
        assert_eq!(WhoAreYou::decode(&envelope).unwrap(), whoareyou);
        assert_eq!(envelope.challenge_data(), challenge_data);
    }

    #[test]
    fn handshake_packet_vector_roundtrip() {
        // Ping handshake packet (flag 2) from
        // https://github.com/ethereum/devp2p/blob/master/discv5/discv5-wire-test-vectors.md
        let dest_id = node_b_id();
        let encoded = &hex!(
            "00000000000000000000000000000000088b3d4342774649305f313964a39e55ea96c005ad521d8c7560413a7008f16c9e6d2f43bbea8814a546b7409ce783d34c4f53245d08da4bb252012b2cba3f4f374a90a75cff91f142fa9be3e0a5f3ef268ccb9065aeecfd67a999e7fdc137e062b2ec4a0eb92947f0d9a74bfbf44dfba776b21301f8b65efd5796706adff216ab862a9186875f9494150c4ae06fa4d1f0396c93f215fa4ef524f1eadf5f0f4126b79336671cbcf7a885b1f8bd2a5d839cf8"
        );
        let read_key = hex!("4f9fac6de7567d1e3b1241dffe90f662");

        let envelope = PacketEnvelope::decode(&dest_id, encoded).unwrap();
        assert_eq!(envelope.header.flag, HANDSHAKE_FLAG);
        let handshake = Handshake::decode(&envelope, &read_key).unwrap();

        assert_eq!(
            handshake.src_id,
            H256::from_slice(&hex!(
                "aaaa8419e9f49d0083561b48287df592939a8d19947d8c0ef88f2a4856a69fbb"
            ))
        );
        assert_eq!(handshake.record, None);
        assert_eq!(
            handshake.eph_pubkey,
            hex!("039a003ba6517b473fa0cd74aefe99dadfdb34627f90fec6362df85803908f53a5").to_vec()
        );
        assert_eq!(
            handshake.message,
            Message::Ping(PingMessage {
                req_id: Bytes::copy_from_slice(&hex!("00000001")),
                enr_seq: 1,
            })
        );

        let masking_iv = u128::from_be_bytes(encoded[..16].try_into().unwrap());
        let nonce = hex!("ffffffffffffffffffffffff");
        let mut buf = Vec::new();
        handshake
            .encode(&mut buf, masking_iv, &nonce, &dest_id, &read_key)
            .unwrap();
        assert_eq!(buf, encoded.to_vec());
    }

    #[test]
    fn handshake_packet_with_record_vector_roundtrip() {
        // Ping handshake message packet (flag 2, with record) from
        // https://github.com/ethereum/devp2p/blob/master/discv5/discv5-wire-test-vectors.md
        let dest_id = node_b_id();
        let encoded = &hex!(
            "00000000000000000000000000000000088b3d4342774649305f313964a39e55ea96c005ad539c8c7560413a7008f16c9e6d2f43bbea8814a546b7409ce783d34c4f53245d08da4bb23698868350aaad22e3ab8dd034f548a1c43cd246be98562fafa0a1fa86d8e7a3b95ae78cc2b988ded6a5b59eb83ad58097252188b902b21481e30e5e285f19735796706adff216ab862a9186875f9494150c4ae06fa4d1f0396c93f215fa4ef524e0ed04c3c21e39b1868e1ca8105e585ec17315e755e6cfc4dd6cb7fd8e1a1f55e49b4b5eb024221482105346f3c82b15fdaae36a3bb12a494683b4a3c7f2ae41306252fed84785e2bbff3b022812d0882f06978df84a80d443972213342d04b9048fc3b1d5fcb1df0f822152eced6da4d3f6df27e70e4539717307a0208cd208d65093ccab5aa596a34d7511401987662d8cf62b139471"
        );
        let read_key = hex!("53b1c075f41876423154e157470c2f48");

        let envelope = PacketEnvelope::decode(&dest_id, encoded).unwrap();
        let handshake = Handshake::decode(&envelope, &read_key).unwrap();

        let record = handshake.record.clone().expect("expected a record");
        assert_eq!(record.pairs().id.as_deref(), Some("v4"));
        assert!(record.pairs().secp256k1.is_some());
        assert_eq!(
            handshake.message,
            Message::Ping(PingMessage {
                req_id: Bytes::copy_from_slice(&hex!("00000001")),
                enr_seq: 1,
            })
        );

        let masking_iv = u128::from_be_bytes(encoded[..16].try_into().unwrap());
        let nonce = hex!("ffffffffffffffffffffffff");
        let mut buf = Vec::new();
        handshake
            .encode(&mut buf, masking_iv, &nonce, &dest_id, &read_key)
            .unwrap();
        assert_eq!(buf, encoded.to_vec());
    }

    #[test]
    fn random_packet_triggers_open_failure() {
        let dest_id = node_b_id();
        let src_id = H256::from_slice(&hex!(
            "aaaa8419e9f49d0083561b48287df592939a8d19947d8c0ef88f2a4856a69fbb"
        ));
        let mut rng = rand::rngs::OsRng;
        let nonce = [7u8; 12];
        let mut buf = Vec::new();
        encode_random_packet(&mut buf, &mut rng, 1, &nonce, &src_id, &dest_id).unwrap();

        let envelope = PacketEnvelope::decode(&dest_id, &buf).unwrap();
        assert_eq!(envelope.header.flag, ORDINARY_FLAG);
        assert_eq!(envelope.header.nonce, nonce);
        assert!(matches!(
            Ordinary::decode(&envelope, &[0u8; 16]),
            Err(PacketCodecError::OpenFailed)
        ));
    }

    #[test]
    fn message_codec_roundtrips() {
        let req_id = Bytes::copy_from_slice(&[1, 2, 3, 4]);
        let messages = vec![
            Message::Ping(PingMessage {
                req_id: req_id.clone(),
                enr_seq: 4321,
            }),
            Message::Pong(PongMessage {
                req_id: req_id.clone(),
                enr_seq: 4321,
                recipient_ip: "18.138.108.67".parse().unwrap(),
                recipient_port: 30303,
            }),
            Message::FindNode(FindNodeMessage {
                req_id: req_id.clone(),
                distances: vec![0, 255, 256],
            }),
            Message::Nodes(NodesMessage {
                req_id: req_id.clone(),
                total: 1,
                nodes: vec![],
            }),
            Message::TalkReq(TalkReqMessage {
                req_id: req_id.clone(),
                protocol: Bytes::from_static(b"portal"),
                request: Bytes::from_static(&[0xde, 0xad]),
            }),
            Message::TalkResp(TalkRespMessage {
                req_id: req_id.clone(),
                response: Bytes::new(),
            }),
            Message::Ticket(TicketMessage {
                req_id: req_id.clone(),
                ticket: Bytes::from_static(&[9, 9]),
                wait_time: 5,
            }),
            Message::TopicQuery(TopicQueryMessage {
                req_id,
                topic: Bytes::from_static(&[1; 32]),
            }),
        ];

        for message in messages {
            let mut buf = Vec::new();
            message.encode(&mut buf);
            assert_eq!(Message::decode(&buf).unwrap(), message);
        }
    }

    #[test]
    fn nodes_message_with_records_roundtrip() {
        let signer = SecretKey::new(&mut rand::rngs::OsRng);
        let node = crate::types::Node::new(
            "18.138.108.67".parse().unwrap(),
            30303,
            30303,
            public_key_from_signing_key(&signer),
        );
        let record = NodeRecord::from_node(&node, 17, &signer).unwrap();

        let message = Message::Nodes(NodesMessage {
            req_id: Bytes::copy_from_slice(&[1]),
            total: 2,
            nodes: vec![record],
        });
        let mut buf = Vec::new();
        message.encode(&mut buf);
        assert_eq!(Message::decode(&buf).unwrap(), message);
    }

    #[test]
    fn undersized_packet_is_rejected() {
        let dest_id = node_b_id();
        assert!(matches!(
            PacketEnvelope::decode(&dest_id, &[0u8; 62]),
            Err(PacketCodecError::InvalidSize)
        ));
    }
}
