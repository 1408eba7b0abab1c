// SPDX-License-Identifier: MIT OR Apache-2.0

//! Inter-context protocol spoken between sandboxed peers and the relay hub.
//!
//! Every frame is a uniform envelope `{kind, roomId, playerId, targetId?,
//! payload?}`. Kind names are stable wire identifiers; the payload carries
//! kind-specific extras (`isHost` on joins, `wasHost`/`reason` on leaves,
//! `reason`/`target` on errors) and the forwarded wire message on
//! deliveries.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use partynet_core::{PlayerId, RoomId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeKind {
    #[serde(rename = "BRIDGE_REGISTER")]
    Register,
    #[serde(rename = "BRIDGE_SEND")]
    Send,
    #[serde(rename = "BRIDGE_DELIVER")]
    Deliver,
    #[serde(rename = "BRIDGE_PEER_JOIN")]
    PeerJoin,
    /// Peer → hub: explicit departure. Hub → peers: departure notice.
    #[serde(rename = "BRIDGE_PEER_LEAVE")]
    PeerLeave,
    #[serde(rename = "BRIDGE_HOST_DISCONNECT")]
    HostDisconnect,
    #[serde(rename = "BRIDGE_HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "BRIDGE_ERROR")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeMessage {
    pub kind: BridgeKind,
    pub room_id: RoomId,
    pub player_id: PlayerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<PlayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl BridgeMessage {
    pub fn register(room_id: &str, player_id: &str) -> Self {
        Self {
            kind: BridgeKind::Register,
            room_id: room_id.to_string(),
            player_id: player_id.to_string(),
            target_id: None,
            payload: None,
        }
    }

    pub fn send(
        room_id: &str,
        player_id: &str,
        target_id: Option<PlayerId>,
        payload: Value,
    ) -> Self {
        Self {
            kind: BridgeKind::Send,
            room_id: room_id.to_string(),
            player_id: player_id.to_string(),
            target_id,
            payload: Some(payload),
        }
    }

    pub fn deliver(room_id: &str, sender_id: &str, payload: Value) -> Self {
        Self {
            kind: BridgeKind::Deliver,
            room_id: room_id.to_string(),
            player_id: sender_id.to_string(),
            target_id: None,
            payload: Some(payload),
        }
    }

    pub fn peer_join(room_id: &str, player_id: &str, is_host: bool) -> Self {
        Self {
            kind: BridgeKind::PeerJoin,
            room_id: room_id.to_string(),
            player_id: player_id.to_string(),
            target_id: None,
            payload: Some(json!({ "isHost": is_host })),
        }
    }

    pub fn peer_leave(room_id: &str, player_id: &str, was_host: bool, reason: &str) -> Self {
        Self {
            kind: BridgeKind::PeerLeave,
            room_id: room_id.to_string(),
            player_id: player_id.to_string(),
            target_id: None,
            payload: Some(json!({ "wasHost": was_host, "reason": reason })),
        }
    }

    pub fn host_disconnect(room_id: &str, player_id: &str) -> Self {
        Self {
            kind: BridgeKind::HostDisconnect,
            room_id: room_id.to_string(),
            player_id: player_id.to_string(),
            target_id: None,
            payload: None,
        }
    }

    pub fn heartbeat(room_id: &str, player_id: &str) -> Self {
        Self {
            kind: BridgeKind::Heartbeat,
            room_id: room_id.to_string(),
            player_id: player_id.to_string(),
            target_id: None,
            payload: None,
        }
    }

    pub fn error(room_id: &str, player_id: &str, reason: &str, target: Option<&str>) -> Self {
        let payload = match target {
            Some(target) => json!({ "reason": reason, "target": target }),
            None => json!({ "reason": reason }),
        };
        Self {
            kind: BridgeKind::Error,
            room_id: room_id.to_string(),
            player_id: player_id.to_string(),
            target_id: None,
            payload: Some(payload),
        }
    }

    pub fn is_host_flag(&self) -> bool {
        self.payload
            .as_ref()
            .and_then(|p| p.get("isHost"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn was_host_flag(&self) -> bool {
        self.payload
            .as_ref()
            .and_then(|p| p.get("wasHost"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn reason(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("reason"))
            .and_then(Value::as_str)
    }

    pub fn error_target(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("target"))
            .and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_use_stable_wire_names() {
        let msg = BridgeMessage::register("room", "peer-a");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "BRIDGE_REGISTER");
        assert_eq!(value["roomId"], "room");
        assert_eq!(value["playerId"], "peer-a");
        assert!(value.get("targetId").is_none());

        let msg = BridgeMessage::heartbeat("room", "peer-a");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "BRIDGE_HEARTBEAT");
    }

    #[test]
    fn join_and_leave_flags_round_trip() {
        let join = BridgeMessage::peer_join("room", "peer-a", true);
        assert!(join.is_host_flag());
        let join = BridgeMessage::peer_join("room", "peer-a", false);
        assert!(!join.is_host_flag());

        let leave = BridgeMessage::peer_leave("room", "peer-a", true, "timeout");
        assert!(leave.was_host_flag());
        assert_eq!(leave.reason(), Some("timeout"));
    }

    #[test]
    fn error_payload_carries_target() {
        let err = BridgeMessage::error("room", "peer-a", "unknown target", Some("peer-b"));
        assert_eq!(err.reason(), Some("unknown target"));
        assert_eq!(err.error_target(), Some("peer-b"));

        let err = BridgeMessage::error("room", "peer-a", "not registered", None);
        assert_eq!(err.error_target(), None);
    }

    #[test]
    fn envelope_round_trips() {
        let msg = BridgeMessage::send(
            "room",
            "peer-a",
            Some("peer-b".to_string()),
            json!({"type": "action", "senderId": "peer-a", "timestamp": 1, "payload": 7}),
        );
        let raw = serde_json::to_string(&msg).unwrap();
        let back: BridgeMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, msg);
    }
}
