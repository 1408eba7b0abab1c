// SPDX-License-Identifier: MIT OR Apache-2.0

//! JSON wire protocol shared by every topology.
//!
//! Every frame is a flat object `{type, senderId, targetId?, timestamp, ...}`.
//! The `action` payload is opaque at this layer; only the state synchronizer
//! above interprets it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::TransportError;
use crate::PlayerId;

/// Unix timestamp in milliseconds, the wire clock.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub sender_id: PlayerId,
    /// Unicast target; `None` means broadcast to the whole room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<PlayerId>,
    pub timestamp: u64,
    #[serde(flatten)]
    pub body: MessageBody,
}

/// Type-specific portion of a frame, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MessageBody {
    /// Opaque game action forwarded to the state synchronizer.
    Action { payload: Value },
    /// Liveness signal, doubling as a passive channel for the sender's
    /// belief about the current host.
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host_id: Option<PlayerId>,
    },
    /// Active host discovery probe.
    HostQuery,
    /// Reply from a peer that believes it knows the host.
    HostAnnounce { host_id: PlayerId },
    /// Reserved for explicit host handoff. Parsed but never emitted.
    HostMigration { new_host_id: PlayerId },
    /// Graceful departure.
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl WireMessage {
    pub fn action(sender: &str, target: Option<&str>, payload: Value) -> Self {
        Self {
            sender_id: sender.to_string(),
            target_id: target.map(str::to_string),
            timestamp: now_millis(),
            body: MessageBody::Action { payload },
        }
    }

    pub fn heartbeat(sender: &str, host_id: Option<PlayerId>) -> Self {
        Self {
            sender_id: sender.to_string(),
            target_id: None,
            timestamp: now_millis(),
            body: MessageBody::Heartbeat { host_id },
        }
    }

    pub fn host_query(sender: &str) -> Self {
        Self {
            sender_id: sender.to_string(),
            target_id: None,
            timestamp: now_millis(),
            body: MessageBody::HostQuery,
        }
    }

    pub fn host_announce(sender: &str, host_id: PlayerId) -> Self {
        Self {
            sender_id: sender.to_string(),
            target_id: None,
            timestamp: now_millis(),
            body: MessageBody::HostAnnounce { host_id },
        }
    }

    pub fn leave(sender: &str, reason: Option<String>) -> Self {
        Self {
            sender_id: sender.to_string(),
            target_id: None,
            timestamp: now_millis(),
            body: MessageBody::Leave { reason },
        }
    }

    pub fn encode(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, TransportError> {
        serde_json::from_str(raw).map_err(|e| TransportError::Malformed(e.to_string()))
    }
}
