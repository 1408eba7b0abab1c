// SPDX-License-Identifier: MIT OR Apache-2.0

//! Direct data channel and the negotiation seam that produces one.
//!
//! The lobby transports never see how a channel comes to exist: a
//! [`PeerConnector`] turns the offer/answer signals relayed through the
//! signaling service into a [`DataChannel`]. The loopback realization wires
//! both halves through a registry shared by the two endpoints (same-process
//! simulation and tests); a WebRTC-backed connector slots in behind the
//! same seam, fed by the ICE servers from the network config.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use partynet_core::TransportError;

/// One end of an established direct channel: ordered, JSON-frame pipes.
pub struct DataChannel {
    pub tx: mpsc::UnboundedSender<String>,
    pub rx: mpsc::UnboundedReceiver<String>,
}

/// Build both ends of a direct channel.
pub fn channel_pair() -> (DataChannel, DataChannel) {
    let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
    let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();
    (
        DataChannel {
            tx: a_to_b_tx,
            rx: b_to_a_rx,
        },
        DataChannel {
            tx: b_to_a_tx,
            rx: a_to_b_rx,
        },
    )
}

/// Turns relayed negotiation signals into a direct channel.
pub trait PeerConnector: Send + Sync {
    /// Client side: produce the offer that starts negotiation.
    fn create_offer(&self) -> Result<Value, TransportError>;

    /// Host side: accept a relayed offer, produce the answer and this
    /// side's channel end.
    fn accept_offer(&self, offer: &Value) -> Result<(Value, DataChannel), TransportError>;

    /// Client side: accept the relayed answer and claim the other end.
    fn accept_answer(&self, answer: &Value) -> Result<DataChannel, TransportError>;
}

/// Registry shared by both endpoints of a same-process negotiation.
/// Injected explicitly; there is no process-wide instance.
#[derive(Default)]
pub struct LoopbackNet {
    pending: Mutex<HashMap<String, PendingLink>>,
}

#[derive(Default)]
struct PendingLink {
    offerer: Option<DataChannel>,
    answerer: Option<DataChannel>,
}

impl LoopbackNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

pub struct LoopbackConnector {
    net: Arc<LoopbackNet>,
}

impl LoopbackConnector {
    pub fn new(net: Arc<LoopbackNet>) -> Self {
        Self { net }
    }
}

fn signal_token(signal: &Value) -> Result<&str, TransportError> {
    signal
        .get("token")
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::Malformed("signal missing token".to_string()))
}

impl PeerConnector for LoopbackConnector {
    fn create_offer(&self) -> Result<Value, TransportError> {
        let token = Uuid::new_v4().to_string();
        let (offerer, answerer) = channel_pair();
        self.net.pending.lock().insert(
            token.clone(),
            PendingLink {
                offerer: Some(offerer),
                answerer: Some(answerer),
            },
        );
        Ok(json!({ "kind": "offer", "token": token }))
    }

    fn accept_offer(&self, offer: &Value) -> Result<(Value, DataChannel), TransportError> {
        let token = signal_token(offer)?;
        let mut pending = self.net.pending.lock();
        let link = pending
            .get_mut(token)
            .ok_or_else(|| TransportError::Signaling("unknown negotiation token".to_string()))?;
        let channel = link
            .answerer
            .take()
            .ok_or_else(|| TransportError::Signaling("offer already answered".to_string()))?;
        Ok((json!({ "kind": "answer", "token": token }), channel))
    }

    fn accept_answer(&self, answer: &Value) -> Result<DataChannel, TransportError> {
        let token = signal_token(answer)?.to_string();
        let mut pending = self.net.pending.lock();
        let link = pending
            .get_mut(&token)
            .ok_or_else(|| TransportError::Signaling("unknown negotiation token".to_string()))?;
        let channel = link
            .offerer
            .take()
            .ok_or_else(|| TransportError::Signaling("answer already accepted".to_string()))?;
        if link.answerer.is_none() {
            pending.remove(&token);
        }
        Ok(channel)
    }
}
