//! # overlay-discovery
//!
//! UDP node discovery for a decentralized peer-to-peer overlay.
//!
//! Nodes are identified by a 256-bit id derived from their public key and
//! locate each other through a Kademlia-style routing table of signed node
//! records. All traffic runs over a single UDP socket using masked,
//! AEAD-encrypted packets; sessions are bootstrapped with a two-phase
//! challenge/response handshake (`WHOAREYOU` / handshake message).
//!
//! On top of the base protocol, user-defined overlays can register *talk*
//! sub-protocols addressed by an opaque byte-string id. The [`portal`]
//! module is one such overlay, providing the request/response plumbing of a
//! content-routing network (ping/pong, find-nodes, find-content).
//!
//! ## Layers
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`discv5`] | Wire codec, sessions, routing table, lookups, protocol core |
//! | [`portal`] | Content-routing overlay riding on the talk channel |
//! | [`types`] | Node identity and signed node records |
//! | [`rlp`] | Recursive-length-prefix encoding used on the wire |
//!
//! ## Quick start
//!
//! ```ignore
//! use overlay_discovery::discv5::{Discovery, DiscoveryConfig};
//!
//! let config = DiscoveryConfig {
//!     bind_address: "0.0.0.0:30305".parse()?,
//!     bootstrap_nodes: bootnodes,
//!     ..Default::default()
//! };
//! let discovery = Discovery::open(config, signer).await?;
//! discovery.start();
//!
//! let found = discovery.lookup(target_id).await;
//! ```

pub mod discv5;
pub(crate) mod metrics;
pub mod portal;
pub mod rlp;
pub mod types;
pub mod utils;
