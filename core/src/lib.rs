// SPDX-License-Identifier: MIT OR Apache-2.0

//! Partynet Core - Wire Protocol and Transport Contract
//!
//! This crate provides the topology-agnostic pieces of the transport layer:
//! - JSON wire message format shared by every topology
//! - The `Transport` contract every concrete transport implements
//! - Observer-list handler registries with unsubscribe guarantees
//! - The transport error taxonomy

#![deny(unsafe_code)]

pub mod error;
pub mod handlers;
pub mod transport;
pub mod wire;

use uuid::Uuid;

/// Opaque identity of a participant. Lexicographic order on the id string
/// is the host-election tiebreak order.
pub type PlayerId = String;

/// Named rendezvous scope peers register into.
pub type RoomId = String;

/// Generate a fresh participant identity.
///
/// Identities are injected into each transport instance rather than held in
/// any process-wide state, so several peers can coexist in one process.
pub fn new_player_id() -> PlayerId {
    format!("peer-{}", Uuid::new_v4())
}

pub use error::TransportError;
pub use handlers::{HandlerId, Handlers};
pub use transport::{ConnectionState, EventHub, Transport};
pub use wire::{now_millis, MessageBody, WireMessage};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_ids_are_unique() {
        let a = new_player_id();
        let b = new_player_id();
        assert_ne!(a, b);
        assert!(a.starts_with("peer-"));
    }
}
