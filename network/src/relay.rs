// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport realization for sandboxed peers, speaking the bridge protocol
//! over a port attached to the in-process relay hub.
//!
//! The hub owns election here: the first registrant in a room is host, and
//! the registrant learns its own flag from the echoed self-join that acks
//! registration. Liveness is bridge-level heartbeats; the hub's sweep turns
//! silence into the same leave path as an explicit departure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use partynet_core::transport::{
    ConnectionHandler, ErrorHandler, EventHub, HostDisconnectHandler, MessageHandler, PeerHandler,
};
use partynet_core::wire::MessageBody;
use partynet_core::{
    new_player_id, ConnectionState, HandlerId, PlayerId, RoomId, Transport, TransportError,
    WireMessage,
};

use crate::bridge::{BridgeKind, BridgeMessage};
use crate::hub::{RelayPort, RelayPortSender};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub room_id: RoomId,
    /// Identity of this instance; generated when `None`.
    pub player_id: Option<PlayerId>,
    pub heartbeat_interval: Duration,
}

impl RelayConfig {
    pub fn for_room(room_id: impl Into<RoomId>) -> Self {
        Self {
            room_id: room_id.into(),
            ..Self::default()
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            room_id: "default".to_string(),
            player_id: None,
            heartbeat_interval: Duration::from_secs(2),
        }
    }
}

struct RelayState {
    /// Remote peer id → host flag as announced by the hub.
    peers: HashMap<PlayerId, bool>,
    host: Option<PlayerId>,
    connection: ConnectionState,
    saw_remote_peer: bool,
    host_disconnect_fired: bool,
    closed: bool,
}

struct RelayInner {
    player_id: PlayerId,
    room_id: RoomId,
    events: EventHub,
    state: Mutex<RelayState>,
    port: RelayPortSender,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct RelayTransport {
    inner: Arc<RelayInner>,
}

impl RelayTransport {
    /// Register over `port` and start the receive and heartbeat tasks.
    /// Must be called within a tokio runtime.
    pub fn register(port: RelayPort, config: RelayConfig) -> Self {
        let player_id = config.player_id.clone().unwrap_or_else(new_player_id);
        let (sender, receiver) = port.split();

        let inner = Arc::new(RelayInner {
            player_id: player_id.clone(),
            room_id: config.room_id.clone(),
            events: EventHub::new(),
            state: Mutex::new(RelayState {
                peers: HashMap::new(),
                host: None,
                connection: ConnectionState::Connecting,
                saw_remote_peer: false,
                host_disconnect_fired: false,
                closed: false,
            }),
            port: sender,
            tasks: Mutex::new(Vec::new()),
        });

        inner
            .port
            .send(BridgeMessage::register(&config.room_id, &player_id));

        let transport = Self { inner };
        transport.spawn_receive_loop(receiver);
        transport.spawn_heartbeat(config.heartbeat_interval);
        info!(player_id = %player_id, room_id = %config.room_id, "registering with relay hub");
        transport
    }

    /// The current host record as announced by the hub.
    pub fn host_id(&self) -> Option<PlayerId> {
        self.inner.state.lock().host.clone()
    }

    fn spawn_receive_loop(&self, mut receiver: mpsc::UnboundedReceiver<BridgeMessage>) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            while let Some(msg) = receiver.recv().await {
                process_bridge_message(&inner, msg);
            }
            // Hub gone; nothing else will ever arrive.
            let changed = {
                let mut state = inner.state.lock();
                if state.closed || state.connection == ConnectionState::Disconnected {
                    false
                } else {
                    state.connection = ConnectionState::Disconnected;
                    true
                }
            };
            if changed {
                warn!("relay hub went away");
                inner.events.emit_connection(ConnectionState::Disconnected);
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    fn spawn_heartbeat(&self, interval: Duration) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                {
                    let state = inner.state.lock();
                    if state.closed {
                        break;
                    }
                }
                inner
                    .port
                    .send(BridgeMessage::heartbeat(&inner.room_id, &inner.player_id));
            }
        });
        self.inner.tasks.lock().push(handle);
    }
}

fn process_bridge_message(inner: &Arc<RelayInner>, msg: BridgeMessage) {
    enum Event {
        Join(PlayerId),
        Leave(PlayerId),
        Message(Value, PlayerId),
        HostDisconnect,
        Connection(ConnectionState),
        Error(TransportError),
    }
    let mut events: Vec<Event> = Vec::new();

    {
        let mut state = inner.state.lock();
        if state.closed {
            return;
        }
        match msg.kind {
            BridgeKind::PeerJoin => {
                let is_host = msg.is_host_flag();
                if msg.player_id == inner.player_id {
                    // Our own echoed join is the registration ack.
                    if is_host {
                        state.host = Some(inner.player_id.clone());
                    }
                    if state.connection == ConnectionState::Connecting {
                        state.connection = ConnectionState::Connected;
                        events.push(Event::Connection(ConnectionState::Connected));
                    }
                    debug!(is_host, "registration acknowledged");
                } else if !state.peers.contains_key(&msg.player_id) {
                    state.peers.insert(msg.player_id.clone(), is_host);
                    state.saw_remote_peer = true;
                    if is_host {
                        state.host = Some(msg.player_id.clone());
                    }
                    events.push(Event::Join(msg.player_id.clone()));
                }
            }
            BridgeKind::PeerLeave => {
                if state.peers.remove(&msg.player_id).is_some() {
                    events.push(Event::Leave(msg.player_id.clone()));
                    if state.peers.is_empty()
                        && state.saw_remote_peer
                        && state.connection != ConnectionState::Disconnected
                    {
                        state.connection = ConnectionState::Disconnected;
                        events.push(Event::Connection(ConnectionState::Disconnected));
                    }
                }
            }
            BridgeKind::HostDisconnect => {
                let local_is_host = state.host.as_deref() == Some(inner.player_id.as_str());
                if !local_is_host && !state.host_disconnect_fired {
                    state.host_disconnect_fired = true;
                    events.push(Event::HostDisconnect);
                }
            }
            BridgeKind::Deliver => match decode_delivery(&msg) {
                Ok(Some((payload, sender))) => {
                    if sender != inner.player_id {
                        events.push(Event::Message(payload, sender));
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(%err, "dropping malformed delivery"),
            },
            BridgeKind::Error => {
                let reason = msg.reason().unwrap_or("bridge error");
                let err = match reason {
                    "not registered" => TransportError::NotRegistered {
                        player_id: inner.player_id.clone(),
                        room_id: inner.room_id.clone(),
                    },
                    "unknown target" => TransportError::UnknownPeer(
                        msg.error_target().unwrap_or_default().to_string(),
                    ),
                    other => TransportError::Signaling(other.to_string()),
                };
                events.push(Event::Error(err));
            }
            BridgeKind::Register | BridgeKind::Send | BridgeKind::Heartbeat => {
                debug!(kind = ?msg.kind, "ignoring peer-bound frame of hub-bound kind");
            }
        }
    }

    for event in events {
        match event {
            Event::Join(peer) => inner.events.emit_peer_join(&peer),
            Event::Leave(peer) => inner.events.emit_peer_leave(&peer),
            Event::Message(payload, sender) => inner.events.emit_message(&payload, &sender),
            Event::HostDisconnect => inner.events.emit_host_disconnect(),
            Event::Connection(connection) => inner.events.emit_connection(connection),
            Event::Error(err) => inner.events.emit_error(err),
        }
    }
}

/// Unwrap a `BRIDGE_DELIVER` payload back into an action's opaque payload.
/// Non-action wire messages are valid but carry nothing for the layer
/// above, so they decode to `None`.
fn decode_delivery(msg: &BridgeMessage) -> Result<Option<(Value, PlayerId)>, TransportError> {
    let payload = msg
        .payload
        .clone()
        .ok_or_else(|| TransportError::Malformed("delivery without payload".to_string()))?;
    let wire: WireMessage = serde_json::from_value(payload)
        .map_err(|e| TransportError::Malformed(e.to_string()))?;
    match wire.body {
        MessageBody::Action { payload } => Ok(Some((payload, wire.sender_id))),
        _ => Ok(None),
    }
}

impl Transport for RelayTransport {
    fn player_id(&self) -> PlayerId {
        self.inner.player_id.clone()
    }

    fn peer_ids(&self) -> Vec<PlayerId> {
        let state = self.inner.state.lock();
        let mut peers: Vec<PlayerId> = state.peers.keys().cloned().collect();
        peers.sort();
        peers
    }

    fn is_host(&self) -> bool {
        let state = self.inner.state.lock();
        state.host.as_deref() == Some(self.inner.player_id.as_str())
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    fn send(&self, payload: Value, target: Option<&str>) {
        let inner = &self.inner;
        {
            let state = inner.state.lock();
            if state.closed {
                debug!("send after disconnect ignored");
                return;
            }
            if let Some(target) = target {
                if !state.peers.contains_key(target) {
                    drop(state);
                    inner
                        .events
                        .emit_error(TransportError::UnknownPeer(target.to_string()));
                    return;
                }
            }
        }
        let wire = WireMessage::action(&inner.player_id, target, payload);
        let body = match serde_json::to_value(&wire) {
            Ok(body) => body,
            Err(err) => {
                warn!(%err, "failed to encode outgoing action");
                return;
            }
        };
        let delivered = inner.port.send(BridgeMessage::send(
            &inner.room_id,
            &inner.player_id,
            target.map(str::to_string),
            body,
        ));
        if !delivered {
            inner.events.emit_error(TransportError::Disconnected);
        }
    }

    fn on_message(&self, handler: MessageHandler) -> HandlerId {
        self.inner.events.on_message(handler)
    }

    fn on_peer_join(&self, handler: PeerHandler) -> HandlerId {
        self.inner.events.on_peer_join(handler)
    }

    fn on_peer_leave(&self, handler: PeerHandler) -> HandlerId {
        self.inner.events.on_peer_leave(handler)
    }

    fn on_host_disconnect(&self, handler: HostDisconnectHandler) -> HandlerId {
        self.inner.events.on_host_disconnect(handler)
    }

    fn on_connection_change(&self, handler: ConnectionHandler) -> HandlerId {
        self.inner.events.on_connection_change(handler)
    }

    fn on_error(&self, handler: ErrorHandler) -> HandlerId {
        self.inner.events.on_error(handler)
    }

    fn unsubscribe(&self, id: HandlerId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    fn disconnect(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.connection = ConnectionState::Disconnected;
            state.peers.clear();
            state.host = None;
        }
        inner.port.send(BridgeMessage::peer_leave(
            &inner.room_id,
            &inner.player_id,
            false,
            "disconnect",
        ));
        inner.events.emit_connection(ConnectionState::Disconnected);
        inner.events.clear();
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!(player_id = %inner.player_id, "relay transport disconnected");
    }
}
