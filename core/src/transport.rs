// SPDX-License-Identifier: MIT OR Apache-2.0

//! The transport contract every topology implements.
//!
//! Higher-level game code talks to whichever realization is configured
//! (mesh, relay hub, signaling-mediated lobby) exclusively through this
//! surface; election, liveness and relay logic stay internal to each
//! realization.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::TransportError;
use crate::handlers::{HandlerId, HandlerIds, Handlers};
use crate::PlayerId;

/// Lifecycle of one local transport instance, driven monotonically by
/// peer-set transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No liveness signal exchanged yet and election still open.
    Connecting,
    /// At least one peer is reachable, or solo-host election completed.
    Connected,
    /// All peers lost, or `disconnect()` was called.
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

pub type MessageHandler = Box<dyn Fn(&Value, &PlayerId) + Send + Sync>;
pub type PeerHandler = Box<dyn Fn(&PlayerId) + Send + Sync>;
pub type HostDisconnectHandler = Box<dyn Fn() + Send + Sync>;
pub type ConnectionHandler = Box<dyn Fn(ConnectionState) + Send + Sync>;
pub type ErrorHandler = Box<dyn Fn(&TransportError) + Send + Sync>;

pub trait Transport: Send + Sync {
    /// Identity of this instance. Pure query, no I/O.
    fn player_id(&self) -> PlayerId;

    /// Every currently known remote peer, sorted. Pure query, no I/O.
    fn peer_ids(&self) -> Vec<PlayerId>;

    /// Whether this instance currently holds the host role.
    fn is_host(&self) -> bool;

    fn connection_state(&self) -> ConnectionState;

    /// Unicast `payload` when `target` is given, otherwise broadcast to
    /// every known peer. Never fails synchronously; an unreachable or
    /// unknown target is reported through the error handlers.
    fn send(&self, payload: Value, target: Option<&str>);

    /// Handler receives `(payload, sender_id)` for every message that did
    /// not originate locally (loopback is filtered).
    fn on_message(&self, handler: MessageHandler) -> HandlerId;

    /// Fires exactly once per join transition, never for the local peer.
    fn on_peer_join(&self, handler: PeerHandler) -> HandlerId;

    /// Fires exactly once per leave transition, never for the local peer.
    fn on_peer_leave(&self, handler: PeerHandler) -> HandlerId;

    /// Fires on non-host peers, exactly once, when the recorded host
    /// becomes unreachable. The session is over at that point; no
    /// automatic re-election happens.
    fn on_host_disconnect(&self, handler: HostDisconnectHandler) -> HandlerId;

    fn on_connection_change(&self, handler: ConnectionHandler) -> HandlerId;

    /// Surfaces handler panics and transport-level send failures without
    /// crashing the dispatching task.
    fn on_error(&self, handler: ErrorHandler) -> HandlerId;

    /// Removal takes effect before the next dispatch; no handler fires
    /// after its own unsubscribe returns.
    fn unsubscribe(&self, id: HandlerId) -> bool;

    /// Idempotent. Flushes a best-effort leave notification, then clears
    /// all local registries and handler lists and cancels every timer.
    /// No events fire afterward.
    fn disconnect(&self);
}

/// Event fan-out shared by every transport realization: one observer list
/// per contract event kind, ids allocated from a single counter so
/// `unsubscribe` is uniform across kinds.
pub struct EventHub {
    ids: HandlerIds,
    messages: Handlers<(Value, PlayerId)>,
    peer_join: Handlers<PlayerId>,
    peer_leave: Handlers<PlayerId>,
    host_disconnect: Handlers<()>,
    connection: Handlers<ConnectionState>,
    errors: Handlers<TransportError>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            ids: HandlerIds::new(),
            messages: Handlers::new(),
            peer_join: Handlers::new(),
            peer_leave: Handlers::new(),
            host_disconnect: Handlers::new(),
            connection: Handlers::new(),
            errors: Handlers::new(),
        }
    }

    /// Reserve an id from the shared counter for an extension event kind
    /// (e.g. a lobby's join-request list) so it stays unsubscribable
    /// through the same entry point.
    pub fn allocate_id(&self) -> HandlerId {
        self.ids.next_id()
    }

    pub fn on_message(&self, handler: MessageHandler) -> HandlerId {
        let id = self.ids.next_id();
        self.messages
            .insert(id, move |(payload, sender): &(Value, PlayerId)| {
                handler(payload, sender)
            });
        id
    }

    pub fn on_peer_join(&self, handler: PeerHandler) -> HandlerId {
        let id = self.ids.next_id();
        self.peer_join.insert(id, move |peer: &PlayerId| handler(peer));
        id
    }

    pub fn on_peer_leave(&self, handler: PeerHandler) -> HandlerId {
        let id = self.ids.next_id();
        self.peer_leave.insert(id, move |peer: &PlayerId| handler(peer));
        id
    }

    pub fn on_host_disconnect(&self, handler: HostDisconnectHandler) -> HandlerId {
        let id = self.ids.next_id();
        self.host_disconnect.insert(id, move |_: &()| handler());
        id
    }

    pub fn on_connection_change(&self, handler: ConnectionHandler) -> HandlerId {
        let id = self.ids.next_id();
        self.connection
            .insert(id, move |state: &ConnectionState| handler(*state));
        id
    }

    pub fn on_error(&self, handler: ErrorHandler) -> HandlerId {
        let id = self.ids.next_id();
        self.errors.insert(id, move |err: &TransportError| handler(err));
        id
    }

    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        self.messages.remove(id)
            || self.peer_join.remove(id)
            || self.peer_leave.remove(id)
            || self.host_disconnect.remove(id)
            || self.connection.remove(id)
            || self.errors.remove(id)
    }

    pub fn clear(&self) {
        self.messages.clear();
        self.peer_join.clear();
        self.peer_leave.clear();
        self.host_disconnect.clear();
        self.connection.clear();
        self.errors.clear();
    }

    pub fn emit_message(&self, payload: &Value, sender: &PlayerId) {
        let panics = self.messages.emit(&(payload.clone(), sender.clone()));
        self.surface_panics(panics);
    }

    pub fn emit_peer_join(&self, peer: &PlayerId) {
        let panics = self.peer_join.emit(peer);
        self.surface_panics(panics);
    }

    pub fn emit_peer_leave(&self, peer: &PlayerId) {
        let panics = self.peer_leave.emit(peer);
        self.surface_panics(panics);
    }

    pub fn emit_host_disconnect(&self) {
        let panics = self.host_disconnect.emit(&());
        self.surface_panics(panics);
    }

    pub fn emit_connection(&self, state: ConnectionState) {
        tracing::debug!(%state, "connection state changed");
        let panics = self.connection.emit(&state);
        self.surface_panics(panics);
    }

    /// Error handlers are the end of the line: a panic inside one is only
    /// logged, so surfacing cannot recurse.
    pub fn emit_error(&self, err: TransportError) {
        tracing::debug!(%err, "transport error surfaced");
        for panic in self.errors.emit(&err) {
            tracing::warn!(panic, "error handler panicked");
        }
    }

    fn surface_panics(&self, panics: Vec<String>) {
        for panic in panics {
            self.emit_error(TransportError::HandlerPanic(panic));
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn unsubscribe_works_across_event_kinds() {
        let hub = EventHub::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_join = fired.clone();
        let join_id = hub.on_peer_join(Box::new(move |_| {
            fired_join.fetch_add(1, Ordering::SeqCst);
        }));
        let fired_msg = fired.clone();
        let msg_id = hub.on_message(Box::new(move |_, _| {
            fired_msg.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(hub.unsubscribe(join_id));
        assert!(hub.unsubscribe(msg_id));
        assert!(!hub.unsubscribe(join_id));

        hub.emit_peer_join(&"peer-x".to_string());
        hub.emit_message(&json!({"n": 1}), &"peer-x".to_string());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_panic_surfaces_through_error_handlers() {
        let hub = EventHub::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        hub.on_message(Box::new(|_, _| panic!("bad handler")));
        let seen_inner = seen.clone();
        hub.on_error(Box::new(move |err| {
            seen_inner.lock().push(err.to_string());
        }));

        hub.emit_message(&json!(null), &"peer-x".to_string());

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("bad handler"));
    }

    #[test]
    fn cleared_hub_is_silent() {
        let hub = EventHub::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_inner = fired.clone();
        hub.on_connection_change(Box::new(move |_| {
            fired_inner.fetch_add(1, Ordering::SeqCst);
        }));

        hub.clear();
        hub.emit_connection(ConnectionState::Disconnected);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn connection_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }
}
