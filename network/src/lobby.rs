// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signaling-mediated transports with lobby admission.
//!
//! The host creates a room keyed by a short share code and gates every
//! joiner behind an explicit approve/deny decision; only after approval is
//! a joiner's negotiation handshake accepted. The client requests to join
//! by code and pends until the host decides. Once negotiation completes,
//! wire messages flow over the direct channel and the signaling service is
//! no longer involved.
//!
//! The host role is fixed at room creation: if the host goes away the
//! session is over for every client, with no re-election on this topology.

use std::collections::{HashMap, HashSet};
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
    new_player_id, ConnectionState, HandlerId, Handlers, PlayerId, Transport, TransportError,
    WireMessage,
};

use crate::link::{DataChannel, PeerConnector};
use crate::signaling::{
    new_share_code, ClientRequest, ServerEvent, ShareCode, SignalingHandle, SignalingSender,
};

#[derive(Debug, Clone)]
pub struct LobbyConfig {
    /// Identity of this instance; generated when `None`.
    pub player_id: Option<PlayerId>,
    /// Host side: the code to publish; generated when `None`.
    pub share_code: Option<ShareCode>,
    /// Bound on every negotiation milestone (room creation, admission
    /// acknowledgement, answer). Human approval itself is unbounded.
    pub connect_timeout: Duration,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            player_id: None,
            share_code: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

struct HostState {
    /// Admitted clients with an established channel.
    clients: HashMap<PlayerId, mpsc::UnboundedSender<String>>,
    pending: HashSet<PlayerId>,
    approved: HashSet<PlayerId>,
    connection: ConnectionState,
    saw_client: bool,
    closed: bool,
}

struct HostInner {
    player_id: PlayerId,
    share_code: ShareCode,
    events: EventHub,
    join_requests: Handlers<PlayerId>,
    connector: Arc<dyn PeerConnector>,
    signaling: SignalingSender,
    state: Mutex<HostState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct LobbyHostTransport {
    inner: Arc<HostInner>,
}

impl LobbyHostTransport {
    /// Create a room on the signaling service and start listening for join
    /// requests. Fails if the room is not acknowledged within the
    /// configured bound.
    pub async fn open(
        signaling: &SignalingHandle,
        connector: Arc<dyn PeerConnector>,
        config: LobbyConfig,
    ) -> Result<Self, TransportError> {
        let player_id = config.player_id.clone().unwrap_or_else(new_player_id);
        let share_code = config.share_code.clone().unwrap_or_else(new_share_code);
        let mut conn = signaling.connect(player_id.clone()).await?;
        conn.request(ClientRequest::CreateRoom {
            share_code: share_code.clone(),
            host_id: player_id.clone(),
        });

        let bound = config.connect_timeout;
        let created = tokio::time::timeout(bound, async {
            loop {
                match conn.next_event().await {
                    Some(ServerEvent::RoomCreated { .. }) => return Ok(()),
                    Some(ServerEvent::Error { reason }) => {
                        return Err(TransportError::Signaling(reason))
                    }
                    Some(other) => debug!(?other, "event before room-created"),
                    None => {
                        return Err(TransportError::Signaling(
                            "signaling connection closed".to_string(),
                        ))
                    }
                }
            }
        })
        .await;
        match created {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout(bound)),
        }

        let (signaling_tx, signaling_events) = conn.split();
        let inner = Arc::new(HostInner {
            player_id: player_id.clone(),
            share_code: share_code.clone(),
            events: EventHub::new(),
            join_requests: Handlers::new(),
            connector,
            signaling: signaling_tx,
            state: Mutex::new(HostState {
                clients: HashMap::new(),
                pending: HashSet::new(),
                approved: HashSet::new(),
                // The host role is fixed, so election is already complete.
                connection: ConnectionState::Connected,
                saw_client: false,
                closed: false,
            }),
            tasks: Mutex::new(Vec::new()),
        });

        let transport = Self { inner };
        transport.spawn_signaling_loop(signaling_events);
        info!(player_id = %player_id, share_code = %share_code, "lobby room open");
        Ok(transport)
    }

    pub fn share_code(&self) -> &str {
        &self.inner.share_code
    }

    /// Clients currently waiting for an approve/deny decision.
    pub fn pending_clients(&self) -> Vec<PlayerId> {
        let state = self.inner.state.lock();
        let mut pending: Vec<PlayerId> = state.pending.iter().cloned().collect();
        pending.sort();
        pending
    }

    /// Handler fires for every join request; decide with `approve_client`
    /// or `deny_client`.
    pub fn on_join_request(&self, handler: PeerHandler) -> HandlerId {
        let id = self.inner.events.allocate_id();
        self.inner
            .join_requests
            .insert(id, move |client: &PlayerId| handler(client));
        id
    }

    /// Let `client_id` in: the signaling service tells it to start
    /// negotiating, and its next offer will be answered.
    pub fn approve_client(&self, client_id: &str) {
        {
            let mut state = self.inner.state.lock();
            if state.closed || !state.pending.remove(client_id) {
                debug!(client_id, "approve for unknown client ignored");
                return;
            }
            state.approved.insert(client_id.to_string());
        }
        info!(client_id, "client approved");
        self.inner.signaling.request(ClientRequest::ApproveClient {
            share_code: self.inner.share_code.clone(),
            client_id: client_id.to_string(),
        });
    }

    /// Turn `client_id` away with a reason it will see verbatim.
    pub fn deny_client(&self, client_id: &str, reason: &str) {
        {
            let mut state = self.inner.state.lock();
            if state.closed || !state.pending.remove(client_id) {
                debug!(client_id, "deny for unknown client ignored");
                return;
            }
        }
        info!(client_id, reason, "client denied");
        self.inner.signaling.request(ClientRequest::DenyClient {
            share_code: self.inner.share_code.clone(),
            client_id: client_id.to_string(),
            reason: Some(reason.to_string()),
        });
    }

    fn spawn_signaling_loop(&self, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if inner.state.lock().closed {
                    break;
                }
                match event {
                    ServerEvent::JoinRequest { client_id, .. } => {
                        let fresh = inner.state.lock().pending.insert(client_id.clone());
                        if fresh {
                            info!(client_id = %client_id, "join requested");
                            let panics = inner.join_requests.emit(&client_id);
                            for panic in panics {
                                inner
                                    .events
                                    .emit_error(TransportError::HandlerPanic(panic));
                            }
                        }
                    }
                    ServerEvent::Signal {
                        sender_id, signal, ..
                    } => host_handle_signal(&inner, sender_id, signal),
                    ServerEvent::ClientLeft { client_id, .. } => {
                        host_drop_client(&inner, &client_id);
                    }
                    ServerEvent::RoomExpired { .. } => {
                        debug!("signaling room expired; established channels unaffected");
                    }
                    other => debug!(?other, "ignoring signaling event"),
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }
}

fn host_handle_signal(inner: &Arc<HostInner>, sender_id: PlayerId, signal: Value) {
    let approved = {
        let state = inner.state.lock();
        !state.closed && state.approved.contains(&sender_id)
    };
    if !approved {
        // An unapproved handshake attempt is never accepted.
        warn!(sender_id = %sender_id, "ignoring handshake from unapproved client");
        return;
    }

    match inner.connector.accept_offer(&signal) {
        Ok((answer, channel)) => {
            inner.signaling.request(ClientRequest::Signal {
                share_code: inner.share_code.clone(),
                target_id: sender_id.clone(),
                signal: answer,
            });
            let DataChannel { tx, rx } = channel;
            {
                let mut state = inner.state.lock();
                state.clients.insert(sender_id.clone(), tx);
                state.saw_client = true;
            }
            let inner_loop = inner.clone();
            let client_id = sender_id.clone();
            let handle = tokio::spawn(async move {
                host_channel_loop(inner_loop, client_id, rx).await;
            });
            inner.tasks.lock().push(handle);
            info!(client_id = %sender_id, "client channel established");
            inner.events.emit_peer_join(&sender_id);
        }
        Err(err) => {
            warn!(%err, sender_id = %sender_id, "negotiation failed");
            inner.events.emit_error(err);
        }
    }
}

async fn host_channel_loop(
    inner: Arc<HostInner>,
    client_id: PlayerId,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(raw) = rx.recv().await {
        let msg = match WireMessage::decode(&raw) {
            Ok(msg) => msg,
            Err(err) => {
                // A single malformed frame must not take the session down.
                warn!(%err, "dropping malformed frame");
                continue;
            }
        };
        if msg.sender_id == inner.player_id {
            continue;
        }
        match msg.body {
            MessageBody::Action { payload } => {
                let targeted_elsewhere = msg
                    .target_id
                    .as_deref()
                    .map_or(false, |target| target != inner.player_id);
                if !targeted_elsewhere {
                    inner.events.emit_message(&payload, &msg.sender_id);
                }
            }
            MessageBody::Leave { reason } => {
                debug!(client_id = %msg.sender_id, reason = ?reason, "client leaving");
                break;
            }
            other => debug!(body = ?other, "ignoring non-action frame"),
        }
    }
    host_drop_client(&inner, &client_id);
}

fn host_drop_client(inner: &Arc<HostInner>, client_id: &PlayerId) {
    let lost_channel;
    let mut connection = None;
    {
        let mut state = inner.state.lock();
        if state.closed {
            return;
        }
        lost_channel = state.clients.remove(client_id).is_some();
        state.pending.remove(client_id);
        state.approved.remove(client_id);
        if state.clients.is_empty()
            && state.saw_client
            && state.connection != ConnectionState::Disconnected
        {
            state.connection = ConnectionState::Disconnected;
            connection = Some(ConnectionState::Disconnected);
        }
    }
    if lost_channel {
        info!(client_id = %client_id, "client left");
        inner.events.emit_peer_leave(client_id);
    }
    if let Some(state) = connection {
        inner.events.emit_connection(state);
    }
}

impl Transport for LobbyHostTransport {
    fn player_id(&self) -> PlayerId {
        self.inner.player_id.clone()
    }

    fn peer_ids(&self) -> Vec<PlayerId> {
        let state = self.inner.state.lock();
        let mut peers: Vec<PlayerId> = state.clients.keys().cloned().collect();
        peers.sort();
        peers
    }

    fn is_host(&self) -> bool {
        true
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    fn send(&self, payload: Value, target: Option<&str>) {
        let inner = &self.inner;
        let wire = WireMessage::action(&inner.player_id, target, payload);
        let raw = match wire.encode() {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%err, "failed to encode outgoing action");
                return;
            }
        };
        let state = inner.state.lock();
        if state.closed {
            debug!("send after disconnect ignored");
            return;
        }
        match target {
            Some(target) => match state.clients.get(target) {
                Some(tx) => {
                    let _ = tx.send(raw);
                }
                None => {
                    let target = target.to_string();
                    drop(state);
                    inner.events.emit_error(TransportError::UnknownPeer(target));
                }
            },
            None => {
                for tx in state.clients.values() {
                    let _ = tx.send(raw.clone());
                }
            }
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
        // Never fires on the host itself; registered for uniformity.
        self.inner.events.on_host_disconnect(handler)
    }

    fn on_connection_change(&self, handler: ConnectionHandler) -> HandlerId {
        self.inner.events.on_connection_change(handler)
    }

    fn on_error(&self, handler: ErrorHandler) -> HandlerId {
        self.inner.events.on_error(handler)
    }

    fn unsubscribe(&self, id: HandlerId) -> bool {
        self.inner.events.unsubscribe(id) || self.inner.join_requests.remove(id)
    }

    fn disconnect(&self) {
        let inner = &self.inner;
        let clients: Vec<mpsc::UnboundedSender<String>> = {
            let mut state = inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.connection = ConnectionState::Disconnected;
            state.pending.clear();
            state.approved.clear();
            state.clients.drain().map(|(_, tx)| tx).collect()
        };
        if let Ok(raw) =
            WireMessage::leave(&inner.player_id, Some("disconnect".to_string())).encode()
        {
            for tx in clients {
                let _ = tx.send(raw.clone());
            }
        }
        inner.signaling.close();
        inner.events.emit_connection(ConnectionState::Disconnected);
        inner.events.clear();
        inner.join_requests.clear();
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!(player_id = %inner.player_id, "lobby host disconnected");
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

struct ClientState {
    host_present: bool,
    host_lost_fired: bool,
    connection: ConnectionState,
    closed: bool,
}

struct ClientInner {
    player_id: PlayerId,
    host_id: PlayerId,
    events: EventHub,
    channel_tx: mpsc::UnboundedSender<String>,
    signaling: SignalingSender,
    state: Mutex<ClientState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct LobbyClientTransport {
    inner: Arc<ClientInner>,
}

impl LobbyClientTransport {
    /// Join the room behind `share_code`. Pends until the host approves or
    /// denies; every other negotiation milestone is bounded by the
    /// configured timeout. On denial the host's reason is returned.
    pub async fn connect(
        signaling: &SignalingHandle,
        share_code: &str,
        connector: Arc<dyn PeerConnector>,
        config: LobbyConfig,
    ) -> Result<Self, TransportError> {
        let player_id = config.player_id.clone().unwrap_or_else(new_player_id);
        let mut conn = signaling.connect(player_id.clone()).await?;
        conn.request(ClientRequest::JoinRoom {
            share_code: share_code.to_string(),
            client_id: player_id.clone(),
        });

        let bound = config.connect_timeout;
        let mut pending = false;
        let host_id = loop {
            let event = if pending {
                // Admission acknowledged; the human decision is unbounded.
                conn.next_event().await
            } else {
                match tokio::time::timeout(bound, conn.next_event()).await {
                    Ok(event) => event,
                    Err(_) => return Err(TransportError::Timeout(bound)),
                }
            };
            match event {
                Some(ServerEvent::JoinPending { .. }) => {
                    pending = true;
                    info!(share_code, "join pending, awaiting host approval");
                }
                Some(ServerEvent::RoomJoined { host_id, .. }) => break host_id,
                Some(ServerEvent::JoinDenied { reason, .. }) => {
                    return Err(TransportError::JoinDenied(reason))
                }
                Some(ServerEvent::RoomExpired { .. }) => {
                    return Err(TransportError::Signaling("room expired".to_string()))
                }
                Some(ServerEvent::HostDisconnected { .. }) => {
                    return Err(TransportError::Signaling("host disconnected".to_string()))
                }
                Some(other) => debug!(?other, "event while joining"),
                None => {
                    return Err(TransportError::Signaling(
                        "signaling connection closed".to_string(),
                    ))
                }
            }
        };

        // Approved: we initiate negotiation.
        let offer = connector.create_offer()?;
        conn.request(ClientRequest::Signal {
            share_code: share_code.to_string(),
            target_id: host_id.clone(),
            signal: offer,
        });
        let answer = match tokio::time::timeout(bound, async {
            loop {
                match conn.next_event().await {
                    Some(ServerEvent::Signal {
                        sender_id, signal, ..
                    }) if sender_id == host_id => return Ok(signal),
                    Some(ServerEvent::HostDisconnected { .. }) => {
                        return Err(TransportError::Signaling("host disconnected".to_string()))
                    }
                    Some(other) => debug!(?other, "event while negotiating"),
                    None => {
                        return Err(TransportError::Signaling(
                            "signaling connection closed".to_string(),
                        ))
                    }
                }
            }
        })
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout(bound)),
        };
        let DataChannel { tx, rx } = connector.accept_answer(&answer)?;

        let (signaling_tx, signaling_events) = conn.split();
        let inner = Arc::new(ClientInner {
            player_id: player_id.clone(),
            host_id: host_id.clone(),
            events: EventHub::new(),
            channel_tx: tx,
            signaling: signaling_tx,
            state: Mutex::new(ClientState {
                host_present: true,
                host_lost_fired: false,
                connection: ConnectionState::Connected,
                closed: false,
            }),
            tasks: Mutex::new(Vec::new()),
        });

        let transport = Self { inner };
        transport.spawn_channel_loop(rx);
        transport.spawn_signaling_loop(signaling_events);
        info!(player_id = %player_id, host_id = %host_id, "joined lobby session");
        Ok(transport)
    }

    /// The fixed host this session was joined through.
    pub fn host_id(&self) -> &PlayerId {
        &self.inner.host_id
    }

    fn spawn_channel_loop(&self, mut rx: mpsc::UnboundedReceiver<String>) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                let msg = match WireMessage::decode(&raw) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(%err, "dropping malformed frame");
                        continue;
                    }
                };
                if msg.sender_id == inner.player_id {
                    continue;
                }
                match msg.body {
                    MessageBody::Action { payload } => {
                        let targeted_elsewhere = msg
                            .target_id
                            .as_deref()
                            .map_or(false, |target| target != inner.player_id);
                        if !targeted_elsewhere {
                            inner.events.emit_message(&payload, &msg.sender_id);
                        }
                    }
                    MessageBody::Leave { reason } => {
                        debug!(reason = ?reason, "host leaving");
                        break;
                    }
                    other => debug!(body = ?other, "ignoring non-action frame"),
                }
            }
            client_host_lost(&inner);
        });
        self.inner.tasks.lock().push(handle);
    }

    fn spawn_signaling_loop(&self, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if inner.state.lock().closed {
                    break;
                }
                match event {
                    ServerEvent::HostDisconnected { .. } => client_host_lost(&inner),
                    ServerEvent::RoomExpired { .. } => {
                        debug!("signaling room expired; the direct channel stands");
                    }
                    other => debug!(?other, "ignoring signaling event"),
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }
}

/// The host is unreachable: the session is presented as ended, never
/// silently retried.
fn client_host_lost(inner: &Arc<ClientInner>) {
    {
        let mut state = inner.state.lock();
        if state.closed || state.host_lost_fired {
            return;
        }
        state.host_lost_fired = true;
        state.host_present = false;
        state.connection = ConnectionState::Disconnected;
    }
    info!(host_id = %inner.host_id, "host disconnected, session over");
    inner.events.emit_peer_leave(&inner.host_id);
    inner.events.emit_host_disconnect();
    inner.events.emit_connection(ConnectionState::Disconnected);
}

impl Transport for LobbyClientTransport {
    fn player_id(&self) -> PlayerId {
        self.inner.player_id.clone()
    }

    fn peer_ids(&self) -> Vec<PlayerId> {
        let state = self.inner.state.lock();
        if state.host_present {
            vec![self.inner.host_id.clone()]
        } else {
            Vec::new()
        }
    }

    fn is_host(&self) -> bool {
        false
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
                if target != inner.host_id || !state.host_present {
                    drop(state);
                    inner
                        .events
                        .emit_error(TransportError::UnknownPeer(target.to_string()));
                    return;
                }
            }
        }
        let wire = WireMessage::action(&inner.player_id, target, payload);
        match wire.encode() {
            Ok(raw) => {
                // A closed channel means the host is gone; the channel
                // loop turns that into host-disconnect.
                let _ = inner.channel_tx.send(raw);
            }
            Err(err) => warn!(%err, "failed to encode outgoing action"),
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
            state.host_present = false;
        }
        if let Ok(raw) =
            WireMessage::leave(&inner.player_id, Some("disconnect".to_string())).encode()
        {
            let _ = inner.channel_tx.send(raw);
        }
        inner.signaling.close();
        inner.events.emit_connection(ConnectionState::Disconnected);
        inner.events.clear();
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!(player_id = %inner.player_id, "lobby client disconnected");
    }
}
