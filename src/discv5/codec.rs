use crate::discv5::messages::{PacketCodecError, PacketEnvelope};

use bytes::BytesMut;
use ethereum_types::H256;
use tokio_util::codec::{Decoder, Encoder};

/// Frames the UDP stream into decoded packet envelopes. Each datagram is one
/// packet; message decryption happens later, once the server has looked up
/// the session keys.
#[derive(Debug)]
pub struct PacketCodec {
    local_node_id: H256,
}

impl PacketCodec {
    pub fn new(local_node_id: H256) -> Self {
        Self { local_node_id }
    }
}

impl Decoder for PacketCodec {
    type Item = PacketEnvelope;
    type Error = PacketCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let datagram = buf.split_to(buf.len());
        Ok(Some(PacketEnvelope::decode(&self.local_node_id, &datagram)?))
    }
}

impl Encoder<PacketEnvelope> for PacketCodec {
    type Error = PacketCodecError;

    fn encode(&mut self, _packet: PacketEnvelope, _buf: &mut BytesMut) -> Result<(), Self::Error> {
        // Outbound packets are encoded per flavor; the codec only receives.
        unimplemented!();
    }
}
