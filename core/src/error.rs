// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors crossing the transport contract boundary.
//!
//! Protocol-internal conditions (discovery timeouts, host-conflict
//! resolution) are resolved locally and never appear here; only conditions
//! the caller must act on do.

use std::time::Duration;
use thiserror::Error;

use crate::{PlayerId, RoomId};

#[derive(Debug, Error)]
pub enum TransportError {
    /// Unicast target is not in the local peer set. Reported through the
    /// error handlers; `send` never fails synchronously.
    #[error("unknown peer: {0}")]
    UnknownPeer(PlayerId),

    /// The sender referenced a room it never registered into. Recoverable
    /// by re-registering.
    #[error("player {player_id} is not registered in room {room_id}")]
    NotRegistered {
        player_id: PlayerId,
        room_id: RoomId,
    },

    /// The lobby host rejected the join request. Carries the host's reason.
    #[error("join denied: {0}")]
    JoinDenied(String),

    /// The signaling service failed or reported a terminal condition.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// No negotiation milestone was reached within the configured bound.
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    /// A frame failed to parse. Malformed frames are logged and dropped,
    /// never propagated into the session.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A subscribed handler panicked; the panic is contained here and
    /// surfaced through the error handlers.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    /// The transport has been disconnected.
    #[error("transport is disconnected")]
    Disconnected,
}
