// SPDX-License-Identifier: MIT OR Apache-2.0

//! Relay hub: in-process broker for peers that cannot address each other
//! directly.
//!
//! One tokio task owns the peer and room registries, so every mutation is
//! serialized by arrival order with no locking; registrations are applied
//! before any message referencing the registered peer. Sandboxed contexts
//! attach a port through the handle and speak [`BridgeMessage`] both ways.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use partynet_core::PlayerId;

use crate::bridge::{BridgeKind, BridgeMessage};

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long a silent peer survives before the sweep evicts it. Long
    /// enough to absorb backgrounded, timer-throttled contexts.
    pub stale_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

pub type PortId = u64;

/// Sending half of a port; cheap to clone into the owning transport.
#[derive(Clone)]
pub struct RelayPortSender {
    port_id: PortId,
    to_hub: mpsc::UnboundedSender<HubCommand>,
}

impl RelayPortSender {
    /// Hand a frame to the hub. Returns `false` once the hub is gone.
    pub fn send(&self, msg: BridgeMessage) -> bool {
        self.to_hub
            .send(HubCommand::Inbound {
                port: self.port_id,
                msg,
            })
            .is_ok()
    }
}

/// One sandboxed context's conduit to the hub.
pub struct RelayPort {
    sender: RelayPortSender,
    receiver: mpsc::UnboundedReceiver<BridgeMessage>,
}

impl RelayPort {
    pub fn send(&self, msg: BridgeMessage) -> bool {
        self.sender.send(msg)
    }

    pub async fn recv(&mut self) -> Option<BridgeMessage> {
        self.receiver.recv().await
    }

    pub fn split(self) -> (RelayPortSender, mpsc::UnboundedReceiver<BridgeMessage>) {
        (self.sender, self.receiver)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub rooms: usize,
    pub peers: usize,
}

enum HubCommand {
    Attach {
        reply: oneshot::Sender<RelayPort>,
    },
    Inbound {
        port: PortId,
        msg: BridgeMessage,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct RelayHubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl RelayHubHandle {
    /// Attach a new port. Returns `None` once the hub has shut down.
    pub async fn attach(&self) -> Option<RelayPort> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HubCommand::Attach { reply }).ok()?;
        rx.await.ok()
    }

    pub async fn stats(&self) -> Option<HubStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HubCommand::Stats { reply }).ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(HubCommand::Shutdown);
    }
}

struct PeerEntry {
    room_id: String,
    port: PortId,
    is_host: bool,
    last_liveness: Instant,
}

pub struct RelayHub {
    config: HubConfig,
    cmd_tx: mpsc::UnboundedSender<HubCommand>,
    ports: HashMap<PortId, mpsc::UnboundedSender<BridgeMessage>>,
    next_port: PortId,
    peers: HashMap<PlayerId, PeerEntry>,
    rooms: HashMap<String, Vec<PlayerId>>,
}

impl RelayHub {
    /// Spawn the hub task and return its handle. Must be called within a
    /// tokio runtime.
    pub fn spawn(config: HubConfig) -> RelayHubHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = RelayHub {
            config,
            cmd_tx: tx.clone(),
            ports: HashMap::new(),
            next_port: 1,
            peers: HashMap::new(),
            rooms: HashMap::new(),
        };
        tokio::spawn(hub.run(rx));
        RelayHubHandle { tx }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<HubCommand>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HubCommand::Attach { reply }) => self.attach(reply),
                    Some(HubCommand::Inbound { port, msg }) => self.handle_message(port, msg),
                    Some(HubCommand::Stats { reply }) => {
                        let _ = reply.send(HubStats {
                            rooms: self.rooms.len(),
                            peers: self.peers.len(),
                        });
                    }
                    Some(HubCommand::Shutdown) | None => break,
                },
                _ = sweep.tick() => self.sweep_stale(),
            }
        }
        info!("relay hub shut down");
    }

    fn attach(&mut self, reply: oneshot::Sender<RelayPort>) {
        let port_id = self.next_port;
        self.next_port += 1;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.ports.insert(port_id, out_tx);
        debug!(port_id, "port attached");
        let _ = reply.send(RelayPort {
            sender: RelayPortSender {
                port_id,
                to_hub: self.cmd_tx.clone(),
            },
            receiver: out_rx,
        });
    }

    fn handle_message(&mut self, port: PortId, msg: BridgeMessage) {
        match msg.kind {
            BridgeKind::Register => self.register(port, msg),
            BridgeKind::Send => self.forward(port, msg),
            BridgeKind::Heartbeat => self.heartbeat(port, msg),
            BridgeKind::PeerLeave => self.leave_peer(&msg.player_id.clone(), "leave"),
            BridgeKind::Deliver
            | BridgeKind::PeerJoin
            | BridgeKind::HostDisconnect
            | BridgeKind::Error => {
                debug!(kind = ?msg.kind, "ignoring hub-bound frame of outbound-only kind");
            }
        }
    }

    fn register(&mut self, port: PortId, msg: BridgeMessage) {
        let room_id = msg.room_id;
        let player_id = msg.player_id;

        if let Some(existing) = self.peers.get_mut(&player_id) {
            // Re-registration after a BRIDGE_ERROR: rebind the port,
            // refresh liveness, re-ack with the current host flag.
            existing.port = port;
            existing.last_liveness = Instant::now();
            let is_host = existing.is_host;
            let room_id = existing.room_id.clone();
            debug!(player_id = %player_id, "peer re-registered");
            self.deliver_to_peer(
                &player_id,
                BridgeMessage::peer_join(&room_id, &player_id, is_host),
            );
            return;
        }

        let members = self.rooms.entry(room_id.clone()).or_default();
        // First registrant in a room holds the host role for the session.
        let is_host = members.is_empty();
        members.push(player_id.clone());
        let existing_members: Vec<PlayerId> = members
            .iter()
            .filter(|member| **member != player_id)
            .cloned()
            .collect();

        self.peers.insert(
            player_id.clone(),
            PeerEntry {
                room_id: room_id.clone(),
                port,
                is_host,
                last_liveness: Instant::now(),
            },
        );
        info!(player_id = %player_id, room_id = %room_id, is_host, "peer registered");

        // Bidirectional join announcements keep every local peer set
        // consistent without peers enumerating each other. The
        // registrant's own join doubles as the registration ack.
        for member in &existing_members {
            self.deliver_to_peer(
                member,
                BridgeMessage::peer_join(&room_id, &player_id, is_host),
            );
            let member_is_host = self
                .peers
                .get(member)
                .map(|entry| entry.is_host)
                .unwrap_or(false);
            self.deliver_to_peer(
                &player_id,
                BridgeMessage::peer_join(&room_id, member, member_is_host),
            );
        }
        self.deliver_to_peer(
            &player_id,
            BridgeMessage::peer_join(&room_id, &player_id, is_host),
        );
    }

    fn forward(&mut self, port: PortId, msg: BridgeMessage) {
        let sender_id = msg.player_id.clone();
        let (room_id, sender_room_ok) = match self.peers.get_mut(&sender_id) {
            None => {
                // Unknown sender is a protocol error the caller can recover
                // from by re-registering; never a silent drop.
                warn!(player_id = %sender_id, "send from unregistered peer");
                self.port_error(port, &msg.room_id, &sender_id, "not registered", None);
                return;
            }
            Some(entry) => {
                entry.last_liveness = Instant::now();
                (entry.room_id.clone(), entry.room_id == msg.room_id)
            }
        };
        if !sender_room_ok {
            self.port_error(port, &msg.room_id, &sender_id, "not registered", None);
            return;
        }

        let payload = msg.payload.unwrap_or(serde_json::Value::Null);
        match msg.target_id {
            Some(target) => {
                let target_ok = self
                    .peers
                    .get(&target)
                    .map(|entry| entry.room_id == room_id)
                    .unwrap_or(false);
                if target_ok {
                    self.deliver_to_peer(
                        &target,
                        BridgeMessage::deliver(&room_id, &sender_id, payload),
                    );
                } else {
                    self.port_error(port, &room_id, &sender_id, "unknown target", Some(&target));
                }
            }
            None => {
                let members: Vec<PlayerId> = self
                    .rooms
                    .get(&room_id)
                    .map(|members| {
                        members
                            .iter()
                            .filter(|member| **member != sender_id)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                for member in members {
                    self.deliver_to_peer(
                        &member,
                        BridgeMessage::deliver(&room_id, &sender_id, payload.clone()),
                    );
                }
            }
        }
    }

    fn heartbeat(&mut self, port: PortId, msg: BridgeMessage) {
        match self.peers.get_mut(&msg.player_id) {
            Some(entry) => entry.last_liveness = Instant::now(),
            None => {
                self.port_error(port, &msg.room_id, &msg.player_id, "not registered", None);
            }
        }
    }

    fn leave_peer(&mut self, player_id: &PlayerId, reason: &str) {
        let entry = match self.peers.remove(player_id) {
            Some(entry) => entry,
            None => return,
        };
        let was_host = entry.is_host;
        let room_id = entry.room_id;

        let remaining: Vec<PlayerId> = match self.rooms.get_mut(&room_id) {
            Some(members) => {
                members.retain(|member| member != player_id);
                members.clone()
            }
            None => Vec::new(),
        };
        if remaining.is_empty() {
            self.rooms.remove(&room_id);
            debug!(room_id = %room_id, "room destroyed");
        }

        info!(player_id = %player_id, room_id = %room_id, was_host, reason, "peer left");
        for member in &remaining {
            self.deliver_to_peer(
                member,
                BridgeMessage::peer_leave(&room_id, player_id, was_host, reason),
            );
            if was_host {
                self.deliver_to_peer(member, BridgeMessage::host_disconnect(&room_id, player_id));
            }
        }
    }

    /// Force-remove peers whose contexts went silent; a crashed sandbox
    /// cannot always emit its own leave.
    fn sweep_stale(&mut self) {
        let now = Instant::now();
        let timeout = self.config.stale_timeout;
        let stale: Vec<PlayerId> = self
            .peers
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_liveness) > timeout)
            .map(|(player_id, _)| player_id.clone())
            .collect();
        for player_id in stale {
            warn!(player_id = %player_id, "evicting stale peer");
            self.leave_peer(&player_id, "timeout");
        }
    }

    fn port_error(
        &mut self,
        port: PortId,
        room_id: &str,
        player_id: &str,
        reason: &str,
        target: Option<&str>,
    ) {
        let msg = BridgeMessage::error(room_id, player_id, reason, target);
        if let Some(tx) = self.ports.get(&port) {
            let _ = tx.send(msg);
        }
    }

    fn deliver_to_peer(&mut self, player_id: &PlayerId, msg: BridgeMessage) {
        let port = match self.peers.get(player_id) {
            Some(entry) => entry.port,
            None => return,
        };
        let delivered = self
            .ports
            .get(&port)
            .map(|tx| tx.send(msg).is_ok())
            .unwrap_or(false);
        if !delivered {
            // The context behind the port is gone; take the same exit path
            // a timeout would.
            debug!(player_id = %player_id, "port closed, evicting");
            self.ports.remove(&port);
            self.leave_peer(player_id, "closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn register(port: &mut RelayPort, room: &str, player: &str) -> BridgeMessage {
        port.send(BridgeMessage::register(room, player));
        port.recv().await.expect("registration ack")
    }

    #[tokio::test]
    async fn first_registrant_is_host() {
        let hub = RelayHub::spawn(HubConfig::default());
        let mut a = hub.attach().await.unwrap();
        let mut b = hub.attach().await.unwrap();

        let ack = register(&mut a, "room", "peer-a").await;
        assert_eq!(ack.kind, BridgeKind::PeerJoin);
        assert_eq!(ack.player_id, "peer-a");
        assert!(ack.is_host_flag());

        let ack = register(&mut b, "room", "peer-b").await;
        // peer-b first learns about peer-a, then about itself.
        assert_eq!(ack.player_id, "peer-a");
        assert!(ack.is_host_flag());
        let own = b.recv().await.unwrap();
        assert_eq!(own.player_id, "peer-b");
        assert!(!own.is_host_flag());

        // peer-a is told about peer-b.
        let join = a.recv().await.unwrap();
        assert_eq!(join.kind, BridgeKind::PeerJoin);
        assert_eq!(join.player_id, "peer-b");
    }

    #[tokio::test]
    async fn unknown_sender_gets_bridge_error() {
        let hub = RelayHub::spawn(HubConfig::default());
        let mut port = hub.attach().await.unwrap();

        port.send(BridgeMessage::send("room", "ghost", None, json!(1)));
        let err = port.recv().await.unwrap();
        assert_eq!(err.kind, BridgeKind::Error);
        assert_eq!(err.reason(), Some("not registered"));
    }

    #[tokio::test]
    async fn empty_room_is_destroyed() {
        let hub = RelayHub::spawn(HubConfig::default());
        let mut a = hub.attach().await.unwrap();
        register(&mut a, "room", "peer-a").await;

        assert_eq!(hub.stats().await.unwrap(), HubStats { rooms: 1, peers: 1 });

        a.send(BridgeMessage::peer_leave("room", "peer-a", false, "leave"));
        // Stats round-trips through the hub task, so the leave has been
        // processed by the time the reply arrives.
        assert_eq!(hub.stats().await.unwrap(), HubStats { rooms: 0, peers: 0 });
    }
}
