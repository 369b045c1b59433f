use crate::rlp::{
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use crate::types::NodeRecord;
use bytes::{BufMut, Bytes};
use ethereum_types::U256;

/// Upper bound on distances in a find-nodes request.
pub const MAX_DISTANCES: usize = 256;
/// Upper bound on records carried by any overlay message.
pub const MAX_RECORDS: usize = 32;

/// Overlay wire format: a one-byte kind tag followed by the structurally
/// encoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalMessage {
    Ping {
        enr_seq: u64,
        data_radius: U256,
    },
    Pong {
        enr_seq: u64,
        data_radius: U256,
    },
    FindNode {
        distances: Vec<u16>,
    },
    Nodes {
        total: u8,
        enrs: Vec<NodeRecord>,
    },
    FindContent {
        content_key: Bytes,
    },
    FoundContent {
        enrs: Vec<NodeRecord>,
        payload: Bytes,
    },
    Advertise {
        content_keys: Vec<Bytes>,
    },
    RequestProofs {
        connection_id: Bytes,
        content_keys: Vec<Bytes>,
    },
}

impl PortalMessage {
    pub const fn kind(&self) -> u8 {
        match self {
            PortalMessage::Ping { .. } => 0x01,
            PortalMessage::Pong { .. } => 0x02,
            PortalMessage::FindNode { .. } => 0x03,
            PortalMessage::Nodes { .. } => 0x04,
            PortalMessage::FindContent { .. } => 0x05,
            PortalMessage::FoundContent { .. } => 0x06,
            PortalMessage::Advertise { .. } => 0x07,
            PortalMessage::RequestProofs { .. } => 0x08,
        }
    }

    pub const fn kind_name(&self) -> &'static str {
        match self {
            PortalMessage::Ping { .. } => "ping",
            PortalMessage::Pong { .. } => "pong",
            PortalMessage::FindNode { .. } => "find-node",
            PortalMessage::Nodes { .. } => "nodes",
            PortalMessage::FindContent { .. } => "find-content",
            PortalMessage::FoundContent { .. } => "found-content",
            PortalMessage::Advertise { .. } => "advertise",
            PortalMessage::RequestProofs { .. } => "request-proofs",
        }
    }

    pub fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_u8(self.kind());
        match self {
            PortalMessage::Ping {
                enr_seq,
                data_radius,
            }
            | PortalMessage::Pong {
                enr_seq,
                data_radius,
            } => {
                Encoder::new(buf)
                    .encode_field(enr_seq)
                    .encode_field(data_radius)
                    .finish();
            }
            PortalMessage::FindNode { distances } => {
                Encoder::new(buf).encode_field(distances).finish();
            }
            PortalMessage::Nodes { total, enrs } => {
                Encoder::new(buf)
                    .encode_field(total)
                    .encode_field(enrs)
                    .finish();
            }
            PortalMessage::FindContent { content_key } => {
                Encoder::new(buf).encode_field(content_key).finish();
            }
            PortalMessage::FoundContent { enrs, payload } => {
                Encoder::new(buf)
                    .encode_field(enrs)
                    .encode_field(payload)
                    .finish();
            }
            PortalMessage::Advertise { content_keys } => {
                Encoder::new(buf).encode_field(content_keys).finish();
            }
            PortalMessage::RequestProofs {
                connection_id,
                content_keys,
            } => {
                Encoder::new(buf)
                    .encode_field(connection_id)
                    .encode_field(content_keys)
                    .finish();
            }
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<PortalMessage, RLPDecodeError> {
        let (kind, body) = bytes.split_first().ok_or(RLPDecodeError::InvalidLength)?;
        match *kind {
            0x01 | 0x02 => {
                let decoder = Decoder::new(body)?;
                let (enr_seq, decoder) = decoder.decode_field("enr_seq")?;
                let (data_radius, decoder) = decoder.decode_field("data_radius")?;
                decoder.finish()?;
                Ok(match *kind {
                    0x01 => PortalMessage::Ping {
                        enr_seq,
                        data_radius,
                    },
                    _ => PortalMessage::Pong {
                        enr_seq,
                        data_radius,
                    },
                })
            }
            0x03 => {
                let decoder = Decoder::new(body)?;
                let (distances, decoder): (Vec<u16>, _) = decoder.decode_field("distances")?;
                decoder.finish()?;
                if distances.len() > MAX_DISTANCES {
                    return Err(RLPDecodeError::InvalidLength);
                }
                Ok(PortalMessage::FindNode { distances })
            }
            0x04 => {
                let decoder = Decoder::new(body)?;
                let (total, decoder) = decoder.decode_field("total")?;
                let (enrs, decoder): (Vec<NodeRecord>, _) = decoder.decode_field("enrs")?;
                decoder.finish()?;
                if enrs.len() > MAX_RECORDS {
                    return Err(RLPDecodeError::InvalidLength);
                }
                Ok(PortalMessage::Nodes { total, enrs })
            }
            0x05 => {
                let decoder = Decoder::new(body)?;
                let (content_key, decoder) = decoder.decode_field("content_key")?;
                decoder.finish()?;
                Ok(PortalMessage::FindContent { content_key })
            }
            0x06 => {
                let decoder = Decoder::new(body)?;
                let (enrs, decoder): (Vec<NodeRecord>, _) = decoder.decode_field("enrs")?;
                let (payload, decoder) = decoder.decode_field("payload")?;
                decoder.finish()?;
                if enrs.len() > MAX_RECORDS {
                    return Err(RLPDecodeError::InvalidLength);
                }
                Ok(PortalMessage::FoundContent { enrs, payload })
            }
            0x07 => {
                let decoder = Decoder::new(body)?;
                let (content_keys, decoder) = decoder.decode_field("content_keys")?;
                decoder.finish()?;
                Ok(PortalMessage::Advertise { content_keys })
            }
            0x08 => {
                let decoder = Decoder::new(body)?;
                let (connection_id, decoder) = decoder.decode_field("connection_id")?;
                let (content_keys, decoder) = decoder.decode_field("content_keys")?;
                decoder.finish()?;
                Ok(PortalMessage::RequestProofs {
                    connection_id,
                    content_keys,
                })
            }
            _ => Err(RLPDecodeError::MalformedData),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Node;
    use crate::utils::public_key_from_signing_key;
    use secp256k1::SecretKey;

    fn sample_record() -> NodeRecord {
        let signer = SecretKey::new(&mut rand::rngs::OsRng);
        let node = Node::new(
            "18.138.108.67".parse().unwrap(),
            30303,
            30303,
            public_key_from_signing_key(&signer),
        );
        NodeRecord::from_node(&node, 1, &signer).unwrap()
    }

    #[test]
    fn overlay_message_roundtrips() {
        let messages = vec![
            PortalMessage::Ping {
                enr_seq: 1,
                data_radius: U256::MAX,
            },
            PortalMessage::Pong {
                enr_seq: 7,
                data_radius: U256::from(12345u64),
            },
            PortalMessage::FindNode {
                distances: vec![0, 255, 256],
            },
            PortalMessage::Nodes {
                total: 1,
                enrs: vec![sample_record()],
            },
            PortalMessage::FindContent {
                content_key: Bytes::from_static(&[0xaa; 33]),
            },
            PortalMessage::FoundContent {
                enrs: vec![],
                payload: Bytes::from_static(b"value"),
            },
            PortalMessage::Advertise {
                content_keys: vec![Bytes::from_static(&[1]), Bytes::from_static(&[2])],
            },
            PortalMessage::RequestProofs {
                connection_id: Bytes::from_static(&[0, 1, 2, 3]),
                content_keys: vec![],
            },
        ];
        for message in messages {
            let encoded = message.encode_to_vec();
            assert_eq!(PortalMessage::decode(&encoded).unwrap(), message);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(PortalMessage::decode(&[0x09, 0xc0]).is_err());
        assert!(PortalMessage::decode(&[]).is_err());
    }

    #[test]
    fn oversized_distance_list_is_rejected() {
        let message = PortalMessage::FindNode {
            distances: (0..=256u16).collect(),
        };
        let encoded = message.encode_to_vec();
        assert!(PortalMessage::decode(&encoded).is_err());
    }
}
