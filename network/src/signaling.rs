// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signaling service: the third party two peers use to exchange
//! connection-negotiation metadata before any direct channel exists.
//!
//! Only metadata flows here; game data never touches the service. The
//! in-process realization runs as a single task owning the room registry,
//! mirroring how the hub serializes mutations by arrival order. A remote
//! (e.g. websocket) realization speaks the same request/event enums.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use partynet_core::{PlayerId, TransportError};

/// Short human-shareable room code.
pub type ShareCode = String;

/// Six characters, uppercase, with lookalike glyphs (O/0, I/1) left out so
/// codes survive being read over voice chat.
pub fn new_share_code() -> ShareCode {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    CreateRoom {
        share_code: ShareCode,
        host_id: PlayerId,
    },
    JoinRoom {
        share_code: ShareCode,
        client_id: PlayerId,
    },
    ApproveClient {
        share_code: ShareCode,
        client_id: PlayerId,
    },
    DenyClient {
        share_code: ShareCode,
        client_id: PlayerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Offer/answer/candidate relay toward `target_id`.
    Signal {
        share_code: ShareCode,
        target_id: PlayerId,
        signal: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    RoomCreated {
        share_code: ShareCode,
    },
    /// Host-side notice that a client wants in.
    JoinRequest {
        share_code: ShareCode,
        client_id: PlayerId,
    },
    JoinPending {
        share_code: ShareCode,
    },
    RoomJoined {
        share_code: ShareCode,
        host_id: PlayerId,
    },
    JoinDenied {
        share_code: ShareCode,
        reason: String,
    },
    Signal {
        share_code: ShareCode,
        sender_id: PlayerId,
        signal: Value,
    },
    ClientLeft {
        share_code: ShareCode,
        client_id: PlayerId,
    },
    HostDisconnected {
        share_code: ShareCode,
    },
    RoomExpired {
        share_code: ShareCode,
    },
    Error {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Rooms vanish this long after creation; negotiation is long done by
    /// then and established channels do not need the service anymore.
    pub room_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            room_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

enum ServerCommand {
    Connect {
        client_id: PlayerId,
        reply: oneshot::Sender<SignalingConnection>,
    },
    Request {
        client_id: PlayerId,
        request: ClientRequest,
    },
    Disconnect {
        client_id: PlayerId,
    },
    Shutdown,
}

/// Sending half of a signaling connection; cheap to clone into transports.
#[derive(Clone)]
pub struct SignalingSender {
    client_id: PlayerId,
    tx: mpsc::UnboundedSender<ServerCommand>,
}

impl SignalingSender {
    pub fn request(&self, request: ClientRequest) -> bool {
        self.tx
            .send(ServerCommand::Request {
                client_id: self.client_id.clone(),
                request,
            })
            .is_ok()
    }

    /// Tell the server this client is gone so rooms it is part of get
    /// cleaned up deliberately rather than on send failure.
    pub fn close(&self) {
        let _ = self.tx.send(ServerCommand::Disconnect {
            client_id: self.client_id.clone(),
        });
    }
}

pub struct SignalingConnection {
    sender: SignalingSender,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl SignalingConnection {
    pub fn client_id(&self) -> &PlayerId {
        &self.sender.client_id
    }

    pub fn request(&self, request: ClientRequest) -> bool {
        self.sender.request(request)
    }

    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    pub fn split(self) -> (SignalingSender, mpsc::UnboundedReceiver<ServerEvent>) {
        (self.sender, self.events)
    }
}

#[derive(Clone)]
pub struct SignalingHandle {
    tx: mpsc::UnboundedSender<ServerCommand>,
}

impl SignalingHandle {
    pub async fn connect(&self, client_id: PlayerId) -> Result<SignalingConnection, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ServerCommand::Connect { client_id, reply })
            .map_err(|_| TransportError::Signaling("signaling server unavailable".to_string()))?;
        rx.await
            .map_err(|_| TransportError::Signaling("signaling server unavailable".to_string()))
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ServerCommand::Shutdown);
    }
}

struct Room {
    host_id: PlayerId,
    members: Vec<PlayerId>,
    pending: Vec<PlayerId>,
    created_at: Instant,
}

pub struct SignalingServer {
    config: SignalingConfig,
    clients: HashMap<PlayerId, mpsc::UnboundedSender<ServerEvent>>,
    rooms: HashMap<ShareCode, Room>,
}

impl SignalingServer {
    /// Spawn the server task and return its handle. Must be called within
    /// a tokio runtime.
    pub fn spawn(config: SignalingConfig) -> SignalingHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = SignalingServer {
            config,
            clients: HashMap::new(),
            rooms: HashMap::new(),
        };
        tokio::spawn(server.run(rx, tx.clone()));
        SignalingHandle { tx }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<ServerCommand>,
        cmd_tx: mpsc::UnboundedSender<ServerCommand>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(ServerCommand::Connect { client_id, reply }) => {
                        let (event_tx, event_rx) = mpsc::unbounded_channel();
                        self.clients.insert(client_id.clone(), event_tx);
                        debug!(client_id = %client_id, "signaling client connected");
                        let _ = reply.send(SignalingConnection {
                            sender: SignalingSender {
                                client_id,
                                tx: cmd_tx.clone(),
                            },
                            events: event_rx,
                        });
                    }
                    Some(ServerCommand::Request { client_id, request }) => {
                        self.handle_request(client_id, request);
                    }
                    Some(ServerCommand::Disconnect { client_id }) => {
                        self.drop_client(&client_id);
                    }
                    Some(ServerCommand::Shutdown) | None => break,
                },
                _ = sweep.tick() => self.sweep_expired(),
            }
        }
        info!("signaling server shut down");
    }

    fn handle_request(&mut self, client_id: PlayerId, request: ClientRequest) {
        match request {
            ClientRequest::CreateRoom {
                share_code,
                host_id,
            } => {
                if self.rooms.contains_key(&share_code) {
                    warn!(share_code = %share_code, "share code already in use");
                    self.notify(
                        &client_id,
                        ServerEvent::Error {
                            reason: "share code already in use".to_string(),
                        },
                    );
                    return;
                }
                self.rooms.insert(
                    share_code.clone(),
                    Room {
                        host_id,
                        members: Vec::new(),
                        pending: Vec::new(),
                        created_at: Instant::now(),
                    },
                );
                info!(share_code = %share_code, host_id = %client_id, "room created");
                self.notify(&client_id, ServerEvent::RoomCreated { share_code });
            }
            ClientRequest::JoinRoom {
                share_code,
                client_id: joiner,
            } => match self.rooms.get_mut(&share_code) {
                None => {
                    self.notify(&client_id, ServerEvent::RoomExpired { share_code });
                }
                Some(room) => {
                    if !room.pending.contains(&joiner) {
                        room.pending.push(joiner.clone());
                    }
                    let host_id = room.host_id.clone();
                    self.notify(
                        &client_id,
                        ServerEvent::JoinPending {
                            share_code: share_code.clone(),
                        },
                    );
                    self.notify(
                        &host_id,
                        ServerEvent::JoinRequest {
                            share_code,
                            client_id: joiner,
                        },
                    );
                }
            },
            ClientRequest::ApproveClient {
                share_code,
                client_id: approved,
            } => {
                let host_id = match self.rooms.get_mut(&share_code) {
                    Some(room) if room.host_id == client_id => {
                        if let Some(index) = room.pending.iter().position(|p| *p == approved) {
                            room.pending.remove(index);
                            room.members.push(approved.clone());
                        }
                        room.host_id.clone()
                    }
                    _ => {
                        self.notify(
                            &client_id,
                            ServerEvent::Error {
                                reason: "no such room or not its host".to_string(),
                            },
                        );
                        return;
                    }
                };
                info!(share_code = %share_code, client_id = %approved, "client approved");
                self.notify(
                    &approved,
                    ServerEvent::RoomJoined {
                        share_code,
                        host_id,
                    },
                );
            }
            ClientRequest::DenyClient {
                share_code,
                client_id: denied,
                reason,
            } => {
                match self.rooms.get_mut(&share_code) {
                    Some(room) if room.host_id == client_id => {
                        room.pending.retain(|p| *p != denied);
                    }
                    _ => return,
                }
                info!(share_code = %share_code, client_id = %denied, "client denied");
                self.notify(
                    &denied,
                    ServerEvent::JoinDenied {
                        share_code,
                        reason: reason.unwrap_or_else(|| "join denied by host".to_string()),
                    },
                );
            }
            ClientRequest::Signal {
                share_code,
                target_id,
                signal,
            } => {
                let allowed = self
                    .rooms
                    .get(&share_code)
                    .map(|room| {
                        let admitted = |id: &PlayerId| {
                            *id == room.host_id || room.members.contains(id)
                        };
                        admitted(&client_id) && admitted(&target_id)
                    })
                    .unwrap_or(false);
                if !allowed {
                    // An unapproved handshake attempt never reaches the
                    // other side.
                    warn!(
                        share_code = %share_code,
                        sender_id = %client_id,
                        "refusing to relay signal for unapproved peer"
                    );
                    return;
                }
                self.notify(
                    &target_id,
                    ServerEvent::Signal {
                        share_code,
                        sender_id: client_id,
                        signal,
                    },
                );
            }
        }
    }

    fn drop_client(&mut self, client_id: &PlayerId) {
        if self.clients.remove(client_id).is_none() {
            return;
        }
        debug!(client_id = %client_id, "signaling client disconnected");

        let mut expired_rooms: Vec<ShareCode> = Vec::new();
        let mut notices: Vec<(PlayerId, ServerEvent)> = Vec::new();
        for (share_code, room) in &mut self.rooms {
            if room.host_id == *client_id {
                for other in room.members.iter().chain(room.pending.iter()) {
                    notices.push((
                        other.clone(),
                        ServerEvent::HostDisconnected {
                            share_code: share_code.clone(),
                        },
                    ));
                }
                expired_rooms.push(share_code.clone());
            } else {
                let was_present = room.members.contains(client_id)
                    || room.pending.contains(client_id);
                room.members.retain(|m| m != client_id);
                room.pending.retain(|p| p != client_id);
                if was_present {
                    notices.push((
                        room.host_id.clone(),
                        ServerEvent::ClientLeft {
                            share_code: share_code.clone(),
                            client_id: client_id.clone(),
                        },
                    ));
                }
            }
        }
        for share_code in expired_rooms {
            self.rooms.remove(&share_code);
        }
        for (target, event) in notices {
            self.notify(&target, event);
        }
    }

    fn sweep_expired(&mut self) {
        let now = Instant::now();
        let ttl = self.config.room_ttl;
        let expired: Vec<ShareCode> = self
            .rooms
            .iter()
            .filter(|(_, room)| now.duration_since(room.created_at) > ttl)
            .map(|(share_code, _)| share_code.clone())
            .collect();
        for share_code in expired {
            if let Some(room) = self.rooms.remove(&share_code) {
                info!(share_code = %share_code, "room expired");
                let mut targets = vec![room.host_id];
                targets.extend(room.members);
                targets.extend(room.pending);
                for target in targets {
                    self.notify(
                        &target,
                        ServerEvent::RoomExpired {
                            share_code: share_code.clone(),
                        },
                    );
                }
            }
        }
    }

    fn notify(&mut self, client_id: &PlayerId, event: ServerEvent) {
        let delivered = self
            .clients
            .get(client_id)
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false);
        if !delivered {
            // Receiver dropped without an explicit close; clean up the
            // same way a deliberate disconnect would.
            self.drop_client(&client_id.clone());
        }
    }
}
