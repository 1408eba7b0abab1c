// SPDX-License-Identifier: MIT OR Apache-2.0

//! Partynet Network - transport realizations for every topology
//!
//! This crate provides the concrete transports behind the shared contract:
//! - Mesh transport with decentralized host discovery over a rendezvous medium
//! - Relay hub broker and transport for sandboxed peers
//! - Signaling-mediated transport with lobby admission
//! - File-backed network configuration

#![deny(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod hub;
pub mod link;
pub mod lobby;
pub mod medium;
pub mod mesh;
pub mod relay;
pub mod signaling;

pub use partynet_core::{
    new_player_id, ConnectionState, PlayerId, RoomId, Transport, TransportError, WireMessage,
};

pub use config::NetworkConfig;
pub use hub::{HubConfig, RelayHub, RelayHubHandle};
pub use lobby::{LobbyClientTransport, LobbyConfig, LobbyHostTransport};
pub use medium::LocalMedium;
pub use mesh::{HostRole, MeshConfig, MeshTransport};
pub use relay::{RelayConfig, RelayTransport};
pub use signaling::{SignalingConfig, SignalingHandle, SignalingServer};
