//! The discovery protocol proper: wire codec, session management, routing
//! table, request tracking, lookups, and the server loop tying them together.

pub mod codec;
pub mod ip_vote;
pub mod lookup;
pub mod messages;
pub mod requests;
pub mod routing;
pub mod server;
pub mod session;
pub mod sessions;
pub mod talk;

pub use server::{Discovery, DiscoveryConfig, DiscoveryError};
