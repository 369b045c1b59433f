//! A content-routing overlay riding on the talk channel.
//!
//! This is the concrete tenant of the talk dispatcher: it registers under
//! the `portal` protocol id, answers overlay pings with its data radius, and
//! wraps the base-layer request plumbing for the overlay message kinds.

pub mod messages;

use crate::{
    discv5::{
        Discovery, DiscoveryError,
        talk::{TalkError, TalkHandler},
    },
    rlp::error::RLPDecodeError,
    types::{Node, NodeRecord},
};
use bytes::Bytes;
use ethereum_types::U256;
use messages::PortalMessage;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// The talk protocol id of the overlay.
pub const PORTAL_PROTOCOL_ID: &[u8] = b"portal";

#[derive(Debug, Error)]
pub enum PortalError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Talk(#[from] TalkError),
    #[error("Malformed overlay message: {0}")]
    Decode(#[from] RLPDecodeError),
    #[error("Peer sent no overlay response")]
    EmptyResponse,
    #[error("Expected {expected} response, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },
}

/// What an overlay peer reported in its pong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadiusPong {
    pub enr_seq: u64,
    pub data_radius: U256,
}

/// The overlay client and its ingress handler, registered on a [`Discovery`]
/// instance.
#[derive(Clone)]
pub struct PortalProtocol {
    discovery: Discovery,
    data_radius: Arc<RwLock<U256>>,
}

impl PortalProtocol {
    /// Registers the overlay on the discovery instance. Fails when another
    /// handler already claimed the protocol id.
    pub fn register(discovery: Discovery) -> Result<Self, PortalError> {
        // Everything not explicitly stored is of interest: full radius.
        let data_radius = Arc::new(RwLock::new(U256::MAX));
        let handler = PortalHandler {
            discovery: discovery.clone(),
            data_radius: data_radius.clone(),
        };
        discovery.register_talk_protocol(PORTAL_PROTOCOL_ID.to_vec(), Arc::new(handler))?;
        Ok(Self {
            discovery,
            data_radius,
        })
    }

    pub fn data_radius(&self) -> U256 {
        *self.data_radius.read()
    }

    pub fn set_data_radius(&self, radius: U256) {
        *self.data_radius.write() = radius;
    }

    /// Overlay ping: exchanges record seq and data radius.
    pub async fn ping(&self, node: &Node) -> Result<RadiusPong, PortalError> {
        let request = PortalMessage::Ping {
            enr_seq: self.discovery.local_record().seq,
            data_radius: *self.data_radius.read(),
        };
        match self.round_trip(node, request).await? {
            PortalMessage::Pong {
                enr_seq,
                data_radius,
            } => Ok(RadiusPong {
                enr_seq,
                data_radius,
            }),
            other => Err(unexpected("pong", &other)),
        }
    }

    /// Overlay find-nodes at the given distances.
    pub async fn find_nodes(
        &self,
        node: &Node,
        distances: Vec<u16>,
    ) -> Result<Vec<NodeRecord>, PortalError> {
        match self
            .round_trip(node, PortalMessage::FindNode { distances })
            .await?
        {
            PortalMessage::Nodes { enrs, .. } => Ok(enrs),
            other => Err(unexpected("nodes", &other)),
        }
    }

    /// Overlay content query. Returns closer nodes and, when the peer holds
    /// the content, its payload.
    pub async fn find_content(
        &self,
        node: &Node,
        content_key: Bytes,
    ) -> Result<(Vec<NodeRecord>, Bytes), PortalError> {
        match self
            .round_trip(node, PortalMessage::FindContent { content_key })
            .await?
        {
            PortalMessage::FoundContent { enrs, payload } => Ok((enrs, payload)),
            other => Err(unexpected("found-content", &other)),
        }
    }

    /// Announces content keys, expecting a proof request back.
    pub async fn advertise(
        &self,
        node: &Node,
        content_keys: Vec<Bytes>,
    ) -> Result<(Bytes, Vec<Bytes>), PortalError> {
        match self
            .round_trip(node, PortalMessage::Advertise { content_keys })
            .await?
        {
            PortalMessage::RequestProofs {
                connection_id,
                content_keys,
            } => Ok((connection_id, content_keys)),
            other => Err(unexpected("request-proofs", &other)),
        }
    }

    async fn round_trip(
        &self,
        node: &Node,
        request: PortalMessage,
    ) -> Result<PortalMessage, PortalError> {
        let response = self
            .discovery
            .talk_req(node, PORTAL_PROTOCOL_ID, request.encode_to_vec())
            .await?;
        if response.is_empty() {
            return Err(PortalError::EmptyResponse);
        }
        Ok(PortalMessage::decode(&response)?)
    }
}

fn unexpected(expected: &'static str, got: &PortalMessage) -> PortalError {
    PortalError::UnexpectedResponse {
        expected,
        got: got.kind_name(),
    }
}

/// The ingress half: answers overlay requests synchronously inside talk
/// dispatch.
struct PortalHandler {
    discovery: Discovery,
    data_radius: Arc<RwLock<U256>>,
}

impl PortalHandler {
    fn answer(&self, message: PortalMessage) -> Option<PortalMessage> {
        match message {
            PortalMessage::Ping { .. } => Some(PortalMessage::Pong {
                enr_seq: self.discovery.local_record().seq,
                data_radius: *self.data_radius.read(),
            }),
            PortalMessage::FindNode { distances } => {
                let enrs = if distances.contains(&0) {
                    vec![self.discovery.local_record()]
                } else {
                    // Non-zero distances will be served from the overlay
                    // routing table once the overlay maintains one.
                    vec![]
                };
                Some(PortalMessage::Nodes { total: 1, enrs })
            }
            PortalMessage::FindContent { .. } => Some(PortalMessage::FoundContent {
                enrs: vec![],
                payload: Bytes::new(),
            }),
            PortalMessage::Advertise { .. } => Some(PortalMessage::RequestProofs {
                connection_id: Bytes::new(),
                content_keys: vec![],
            }),
            // A response kind arriving as a request is nonsense.
            PortalMessage::Pong { .. }
            | PortalMessage::Nodes { .. }
            | PortalMessage::FoundContent { .. }
            | PortalMessage::RequestProofs { .. } => None,
        }
    }
}

impl TalkHandler for PortalHandler {
    fn handle(&self, request: &[u8]) -> Vec<u8> {
        let message = match PortalMessage::decode(request) {
            Ok(message) => message,
            Err(e) => {
                trace!(err = %e, "Dropping malformed overlay request");
                return Vec::new();
            }
        };
        self.answer(message)
            .map(|response| response.encode_to_vec())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discv5::DiscoveryConfig;
    use secp256k1::SecretKey;

    async fn local_discovery() -> Discovery {
        let config = DiscoveryConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        Discovery::open(config, SecretKey::new(&mut rand::rngs::OsRng))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn overlay_registers_once() {
        let discovery = local_discovery().await;
        assert!(PortalProtocol::register(discovery.clone()).is_ok());
        assert!(matches!(
            PortalProtocol::register(discovery),
            Err(PortalError::Talk(TalkError::AlreadyRegistered))
        ));
    }

    #[tokio::test]
    async fn overlay_ping_reports_radius_and_seq() {
        let discovery = local_discovery().await;
        let portal = PortalProtocol::register(discovery.clone()).unwrap();

        let handler = PortalHandler {
            discovery,
            data_radius: portal.data_radius.clone(),
        };
        let request = PortalMessage::Ping {
            enr_seq: 1,
            data_radius: U256::MAX,
        };
        let response = handler.handle(&request.encode_to_vec());
        assert_eq!(
            PortalMessage::decode(&response).unwrap(),
            PortalMessage::Pong {
                enr_seq: 1,
                data_radius: U256::MAX,
            }
        );
    }

    #[tokio::test]
    async fn overlay_find_node_distance_rules() {
        let discovery = local_discovery().await;
        let local_record = discovery.local_record();
        let portal = PortalProtocol::register(discovery.clone()).unwrap();
        let handler = PortalHandler {
            discovery,
            data_radius: portal.data_radius.clone(),
        };

        // Empty distance list: an empty but well-formed answer.
        let response = handler.handle(
            &PortalMessage::FindNode { distances: vec![] }.encode_to_vec(),
        );
        assert_eq!(
            PortalMessage::decode(&response).unwrap(),
            PortalMessage::Nodes {
                total: 1,
                enrs: vec![]
            }
        );

        // Distance zero names the node itself.
        let response = handler.handle(
            &PortalMessage::FindNode { distances: vec![0] }.encode_to_vec(),
        );
        assert_eq!(
            PortalMessage::decode(&response).unwrap(),
            PortalMessage::Nodes {
                total: 1,
                enrs: vec![local_record]
            }
        );
    }

    #[tokio::test]
    async fn malformed_overlay_request_yields_empty_response() {
        let discovery = local_discovery().await;
        let portal = PortalProtocol::register(discovery.clone()).unwrap();
        let handler = PortalHandler {
            discovery,
            data_radius: portal.data_radius.clone(),
        };
        assert!(handler.handle(&[0xff, 0x00]).is_empty());
        // A response kind used as a request is equally unanswerable.
        let bogus = PortalMessage::Pong {
            enr_seq: 1,
            data_radius: U256::MAX,
        };
        assert!(handler.handle(&bogus.encode_to_vec()).is_empty());
    }
}
