// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process rendezvous medium for mesh peers.
//!
//! Stands in for the public relay/tracker medium: every frame published
//! into an `(app_id, room_id)` bus reaches every joined peer, including the
//! publisher. Loopback filtering is the transport's job. A WAN-backed
//! medium swaps in behind the same join surface.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Frames a slow receiver may fall behind by before the bus drops some.
const ROOM_BUFFER: usize = 256;

#[derive(Clone, Default)]
pub struct LocalMedium {
    rooms: Arc<Mutex<HashMap<(String, String), broadcast::Sender<String>>>>,
}

/// One peer's attachment to a room bus.
pub struct MediumConn {
    pub tx: broadcast::Sender<String>,
    pub rx: broadcast::Receiver<String>,
}

impl LocalMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the bus for `room_id` scoped to `app_id`. The bus is created
    /// lazily on first join; rooms in different app namespaces never
    /// collide.
    pub fn join(&self, app_id: &str, room_id: &str) -> MediumConn {
        let mut rooms = self.rooms.lock();
        let tx = rooms
            .entry((app_id.to_string(), room_id.to_string()))
            .or_insert_with(|| broadcast::channel(ROOM_BUFFER).0)
            .clone();
        let rx = tx.subscribe();
        MediumConn { tx, rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_reach_every_member_including_sender() {
        let medium = LocalMedium::new();
        let a = medium.join("app", "room");
        let mut b = medium.join("app", "room");

        a.tx.send("hello".to_string()).unwrap();

        assert_eq!(b.rx.recv().await.unwrap(), "hello");
        // The publisher's own receiver sees the frame too; transports
        // filter loopback by sender id.
        let mut a_rx = a.rx;
        assert_eq!(a_rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn rooms_are_isolated_by_name_and_namespace() {
        let medium = LocalMedium::new();
        let a = medium.join("app", "room-1");
        let mut other_room = medium.join("app", "room-2");
        let mut other_app = medium.join("other-app", "room-1");

        a.tx.send("frame".to_string()).unwrap();

        assert!(other_room.rx.try_recv().is_err());
        assert!(other_app.rx.try_recv().is_err());
    }
}
