// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mesh transport with decentralized host discovery.
//!
//! Peers reach each other through a shared rendezvous medium with no
//! central authority, so the transport owns the full election: active
//! `host_query`/`host_announce` discovery, a bounded solo-host window, and
//! deterministic conflict resolution fed by both announcements and the
//! host belief piggybacked on every heartbeat. The host is sticky: once
//! the session has one, losing it ends the session instead of triggering
//! re-election.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use partynet_core::transport::{
    ConnectionHandler, ErrorHandler, EventHub, HostDisconnectHandler, MessageHandler, PeerHandler,
};
use partynet_core::wire::MessageBody;
use partynet_core::{
    new_player_id, ConnectionState, HandlerId, PlayerId, RoomId, Transport, TransportError,
    WireMessage,
};

use crate::medium::{LocalMedium, MediumConn};

/// Election role override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostRole {
    /// Participate in discovery; may self-promote after the window.
    #[default]
    Auto,
    /// Fixed host from creation; no election.
    Host,
    /// Never self-promotes; adopts whatever host it discovers.
    Observer,
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Application namespace; rooms only collide within one namespace.
    pub app_id: String,
    pub room_id: RoomId,
    /// Identity of this instance; generated when `None`.
    pub player_id: Option<PlayerId>,
    pub role: HostRole,
    pub heartbeat_interval: Duration,
    /// A peer silent longer than this is evicted from the local peer set.
    pub peer_timeout: Duration,
    /// How long discovery waits for an answer before solo-host promotion.
    pub discovery_window: Duration,
}

impl MeshConfig {
    pub fn for_room(room_id: impl Into<RoomId>) -> Self {
        Self {
            room_id: room_id.into(),
            ..Self::default()
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            app_id: "partynet".to_string(),
            room_id: "default".to_string(),
            player_id: None,
            role: HostRole::Auto,
            heartbeat_interval: Duration::from_secs(2),
            peer_timeout: Duration::from_secs(10),
            discovery_window: Duration::from_secs(3),
        }
    }
}

struct MeshState {
    peers: HashMap<PlayerId, Instant>,
    host: Option<PlayerId>,
    connection: ConnectionState,
    saw_remote_peer: bool,
    host_disconnect_fired: bool,
    closed: bool,
}

struct MeshInner {
    player_id: PlayerId,
    role: HostRole,
    peer_timeout: Duration,
    events: EventHub,
    state: Mutex<MeshState>,
    out: tokio::sync::broadcast::Sender<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshInner {
    fn send_frame(&self, msg: &WireMessage) {
        match msg.encode() {
            // A send with no listeners just means we are alone in the room.
            Ok(raw) => {
                let _ = self.out.send(raw);
            }
            Err(err) => warn!(%err, "failed to encode outgoing frame"),
        }
    }
}

/// Events collected under the state lock, dispatched after it is released
/// so handlers can freely call back into the transport.
#[derive(Default)]
struct Effects {
    replies: Vec<WireMessage>,
    connection: Option<ConnectionState>,
    joins: Vec<PlayerId>,
    messages: Vec<(Value, PlayerId)>,
    leaves: Vec<PlayerId>,
    host_disconnect: bool,
}

impl Effects {
    fn dispatch(self, inner: &MeshInner) {
        for reply in &self.replies {
            inner.send_frame(reply);
        }
        if let Some(state) = self.connection {
            inner.events.emit_connection(state);
        }
        for peer in &self.joins {
            inner.events.emit_peer_join(peer);
        }
        for (payload, sender) in &self.messages {
            inner.events.emit_message(payload, sender);
        }
        for peer in &self.leaves {
            inner.events.emit_peer_leave(peer);
        }
        if self.host_disconnect {
            inner.events.emit_host_disconnect();
        }
    }
}

/// Deterministic tiebreak for conflicting host claims: the
/// lexicographically lowest id among ourselves, the announced host, and
/// every currently known peer wins. Both claimants run the same rule over
/// (eventually) the same candidates, so beliefs converge without further
/// negotiation rounds.
fn resolve_host_conflict<'a, I>(self_id: &str, announced: &str, peers: I) -> PlayerId
where
    I: IntoIterator<Item = &'a PlayerId>,
{
    let mut winner = if announced < self_id { announced } else { self_id };
    for peer in peers {
        if peer.as_str() < winner {
            winner = peer.as_str();
        }
    }
    winner.to_string()
}

#[derive(Clone)]
pub struct MeshTransport {
    inner: Arc<MeshInner>,
}

impl MeshTransport {
    /// Join `config.room_id` over `medium` and start discovery.
    ///
    /// Must be called within a tokio runtime; the transport owns its
    /// heartbeat, receive, and liveness tasks until `disconnect()`.
    pub fn join(medium: &LocalMedium, config: MeshConfig) -> Self {
        let MediumConn { tx, rx } = medium.join(&config.app_id, &config.room_id);
        let player_id = config.player_id.clone().unwrap_or_else(new_player_id);
        let fixed_host = config.role == HostRole::Host;

        let inner = Arc::new(MeshInner {
            player_id: player_id.clone(),
            role: config.role,
            peer_timeout: config.peer_timeout,
            events: EventHub::new(),
            state: Mutex::new(MeshState {
                peers: HashMap::new(),
                host: fixed_host.then(|| player_id.clone()),
                // A fixed host's election is already complete.
                connection: if fixed_host {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Connecting
                },
                saw_remote_peer: false,
                host_disconnect_fired: false,
                closed: false,
            }),
            out: tx,
            tasks: Mutex::new(Vec::new()),
        });

        let transport = Self { inner };
        transport.spawn_receive_loop(rx);
        transport.spawn_heartbeat(config.heartbeat_interval);
        transport.spawn_liveness_sweep(config.heartbeat_interval);

        match config.role {
            HostRole::Host => {
                transport
                    .inner
                    .send_frame(&WireMessage::host_announce(&player_id, player_id.clone()));
            }
            HostRole::Auto => {
                transport
                    .inner
                    .send_frame(&WireMessage::host_query(&player_id));
                transport.spawn_discovery_window(config.discovery_window);
            }
            HostRole::Observer => {
                transport
                    .inner
                    .send_frame(&WireMessage::host_query(&player_id));
            }
        }

        info!(
            player_id = %player_id,
            room_id = %config.room_id,
            role = ?config.role,
            "joined mesh room"
        );
        transport
    }

    /// The current host record, if discovery has resolved one.
    pub fn host_id(&self) -> Option<PlayerId> {
        self.inner.state.lock().host.clone()
    }

    fn spawn_receive_loop(&self, mut rx: tokio::sync::broadcast::Receiver<String>) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(raw) => process_frame(&inner, &raw),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "mesh receiver lagged, frames dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
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
                let host = {
                    let state = inner.state.lock();
                    if state.closed {
                        break;
                    }
                    state.host.clone()
                };
                inner.send_frame(&WireMessage::heartbeat(&inner.player_id, host));
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    fn spawn_liveness_sweep(&self, interval: Duration) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let mut effects = Effects::default();
                {
                    let mut state = inner.state.lock();
                    if state.closed {
                        break;
                    }
                    let now = Instant::now();
                    let timeout = inner.peer_timeout;
                    let stale: Vec<PlayerId> = state
                        .peers
                        .iter()
                        .filter(|(_, last_seen)| now.duration_since(**last_seen) > timeout)
                        .map(|(peer, _)| peer.clone())
                        .collect();
                    for peer in stale {
                        debug!(peer = %peer, "peer timed out");
                        remove_peer(&inner, &mut state, &peer, &mut effects);
                    }
                }
                effects.dispatch(&inner);
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    fn spawn_discovery_window(&self, window: Duration) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut effects = Effects::default();
            {
                let mut state = inner.state.lock();
                if state.closed || state.host.is_some() {
                    return;
                }
                // Nobody answered the query and nobody claimed the room:
                // promote ourselves. Simultaneous starters both land here
                // and converge through the heartbeat-fed tiebreak.
                state.host = Some(inner.player_id.clone());
                if state.connection == ConnectionState::Connecting {
                    state.connection = ConnectionState::Connected;
                    effects.connection = Some(ConnectionState::Connected);
                }
            }
            info!(player_id = %inner.player_id, "discovery window closed, becoming host");
            inner.send_frame(&WireMessage::host_announce(
                &inner.player_id,
                inner.player_id.clone(),
            ));
            effects.dispatch(&inner);
        });
        self.inner.tasks.lock().push(handle);
    }
}

fn process_frame(inner: &Arc<MeshInner>, raw: &str) {
    let msg = match WireMessage::decode(raw) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(%err, "dropping malformed frame");
            return;
        }
    };
    if msg.sender_id == inner.player_id {
        return; // loopback
    }

    let mut effects = Effects::default();
    {
        let mut state = inner.state.lock();
        if state.closed {
            return;
        }
        // A leave must not re-admit the departing peer.
        if !matches!(msg.body, MessageBody::Leave { .. }) {
            observe_peer(&mut state, &msg.sender_id, &mut effects);
        }
        match &msg.body {
            MessageBody::Action { payload } => {
                let targeted_elsewhere = msg
                    .target_id
                    .as_deref()
                    .map_or(false, |target| target != inner.player_id);
                if !targeted_elsewhere {
                    effects.messages.push((payload.clone(), msg.sender_id.clone()));
                }
            }
            MessageBody::Heartbeat { host_id } => {
                if let Some(claimed) = host_id {
                    reconcile_host(inner, &mut state, claimed);
                }
            }
            MessageBody::HostQuery => {
                if state.host.as_deref() == Some(inner.player_id.as_str()) {
                    effects.replies.push(WireMessage::host_announce(
                        &inner.player_id,
                        inner.player_id.clone(),
                    ));
                }
            }
            MessageBody::HostAnnounce { host_id } => {
                reconcile_host(inner, &mut state, host_id);
            }
            MessageBody::HostMigration { new_host_id } => {
                // Reserved for forward compatibility; sticky host means no
                // migration path exists today.
                debug!(new_host_id = %new_host_id, "ignoring reserved host_migration");
            }
            MessageBody::Leave { reason } => {
                debug!(peer = %msg.sender_id, reason = ?reason, "peer left");
                remove_peer(inner, &mut state, &msg.sender_id, &mut effects);
            }
        }
    }
    effects.dispatch(inner);
}

fn observe_peer(state: &mut MeshState, sender: &PlayerId, effects: &mut Effects) {
    match state.peers.entry(sender.clone()) {
        Entry::Occupied(mut entry) => {
            entry.insert(Instant::now());
        }
        Entry::Vacant(entry) => {
            entry.insert(Instant::now());
            state.saw_remote_peer = true;
            effects.joins.push(sender.clone());
            if state.connection == ConnectionState::Connecting {
                state.connection = ConnectionState::Connected;
                effects.connection = Some(ConnectionState::Connected);
            }
            debug!(peer = %sender, "peer joined");
        }
    }
}

fn reconcile_host(inner: &MeshInner, state: &mut MeshState, claimed: &PlayerId) {
    match state.host.clone() {
        None => {
            // First claim wins; observers adopt it like everyone else.
            info!(host = %claimed, "adopted host");
            state.host = Some(claimed.clone());
        }
        Some(current) if current == *claimed => {}
        Some(current) => {
            // Observers never self-promote, so they leave their own id out
            // of the candidate set.
            let winner = if inner.role == HostRole::Observer {
                resolve_host_conflict(claimed, claimed, state.peers.keys())
            } else {
                resolve_host_conflict(&inner.player_id, claimed, state.peers.keys())
            };
            if winner != current {
                info!(old = %current, new = %winner, "host conflict resolved");
                state.host = Some(winner);
            }
        }
    }
}

fn remove_peer(inner: &MeshInner, state: &mut MeshState, peer: &PlayerId, effects: &mut Effects) {
    if state.peers.remove(peer).is_none() {
        return;
    }
    effects.leaves.push(peer.clone());

    let lost_host = state.host.as_deref() == Some(peer.as_str());
    if lost_host && !state.host_disconnect_fired {
        // Sticky host: the record stays pointing at the dead host and the
        // session is over for everyone; nobody re-elects.
        state.host_disconnect_fired = true;
        effects.host_disconnect = true;
        info!(host = %peer, "host disconnected, session over");
    }

    if state.peers.is_empty()
        && state.saw_remote_peer
        && state.connection != ConnectionState::Disconnected
    {
        state.connection = ConnectionState::Disconnected;
        effects.connection = Some(ConnectionState::Disconnected);
    }
}

impl Transport for MeshTransport {
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
        inner.send_frame(&WireMessage::action(&inner.player_id, target, payload));
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
        inner.send_frame(&WireMessage::leave(
            &inner.player_id,
            Some("disconnect".to_string()),
        ));
        inner.events.emit_connection(ConnectionState::Disconnected);
        inner.events.clear();
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!(player_id = %inner.player_id, "mesh transport disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tiebreak_picks_lowest_of_self_and_announced() {
        let peers: Vec<PlayerId> = vec![];
        assert_eq!(resolve_host_conflict("b", "a", &peers), "a");
        assert_eq!(resolve_host_conflict("a", "b", &peers), "a");
    }

    #[test]
    fn tiebreak_can_pick_a_bystander_peer() {
        let peers: Vec<PlayerId> = vec!["c".into(), "a".into()];
        // Neither claimant wins when a known peer sorts lower than both.
        assert_eq!(resolve_host_conflict("b", "d", &peers), "a");
    }

    proptest! {
        #[test]
        fn tiebreak_is_order_independent(
            self_id in "[a-z]{1,8}",
            announced in "[a-z]{1,8}",
            peers in proptest::collection::vec("[a-z]{1,8}", 0..8),
        ) {
            let forward = resolve_host_conflict(&self_id, &announced, &peers);
            let reversed: Vec<PlayerId> = peers.iter().rev().cloned().collect();
            let backward = resolve_host_conflict(&self_id, &announced, &reversed);
            prop_assert_eq!(&forward, &backward);

            let mut candidates = peers.clone();
            candidates.push(self_id.clone());
            candidates.push(announced.clone());
            let lowest = candidates.iter().min().cloned().unwrap_or_default();
            prop_assert_eq!(forward, lowest);
        }
    }
}
