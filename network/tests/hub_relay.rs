// SPDX-License-Identifier: MIT OR Apache-2.0

//! Relay hub semantics driven over raw ports: registration acks, fan-out
//! ordering, stale eviction, and recoverable errors.

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, timeout};

use partynet_network::bridge::{BridgeKind, BridgeMessage};
use partynet_network::hub::{HubConfig, RelayHub};

fn fast_hub_config() -> HubConfig {
    HubConfig {
        stale_timeout: Duration::from_secs(3),
        sweep_interval: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn fanout_preserves_per_sender_order() {
    common::init_tracing();
    let hub = RelayHub::spawn(HubConfig::default());
    let a = hub.attach().await.unwrap();
    let mut b = hub.attach().await.unwrap();

    a.send(BridgeMessage::register("room", "peer-a"));
    b.send(BridgeMessage::register("room", "peer-b"));

    for n in 0..20 {
        a.send(BridgeMessage::send("room", "peer-a", None, json!(n)));
    }

    let mut received = Vec::new();
    while received.len() < 20 {
        let msg = timeout(Duration::from_secs(5), b.recv())
            .await
            .expect("delivery within bound")
            .expect("hub alive");
        if msg.kind == BridgeKind::Deliver {
            received.push(msg.payload.unwrap());
        }
    }
    let expected: Vec<serde_json::Value> = (0..20).map(|n| json!(n)).collect();
    assert_eq!(received, expected);
}

#[tokio::test(start_paused = true)]
async fn stale_host_eviction_notifies_with_host_disconnect() {
    common::init_tracing();
    let hub = RelayHub::spawn(fast_hub_config());
    let host_port = hub.attach().await.unwrap();
    let live_port = hub.attach().await.unwrap();

    // The host registers first, then goes silent.
    host_port.send(BridgeMessage::register("room", "peer-host"));
    live_port.send(BridgeMessage::register("room", "peer-live"));

    let (live_tx, mut live_rx) = live_port.split();
    // Keep the live peer alive past the sweep.
    let heartbeat_tx = live_tx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            if !heartbeat_tx.send(BridgeMessage::heartbeat("room", "peer-live")) {
                break;
            }
        }
    });

    let mut leaves = Vec::new();
    let mut host_disconnects = 0;
    timeout(Duration::from_secs(30), async {
        loop {
            match live_rx.recv().await.expect("hub alive") {
                msg if msg.kind == BridgeKind::PeerLeave => {
                    assert_eq!(msg.player_id, "peer-host");
                    assert!(msg.was_host_flag());
                    assert_eq!(msg.reason(), Some("timeout"));
                    leaves.push(msg.player_id);
                }
                msg if msg.kind == BridgeKind::HostDisconnect => {
                    host_disconnects += 1;
                    break;
                }
                _ => {}
            }
        }
    })
    .await
    .expect("eviction within the stale timeout");

    assert_eq!(leaves.len(), 1);
    assert_eq!(host_disconnects, 1);

    // The live peer survived the sweep.
    let stats = hub.stats().await.unwrap();
    assert_eq!(stats.peers, 1);
    assert_eq!(stats.rooms, 1);
}

#[tokio::test]
async fn targeted_send_to_unknown_peer_errors_back() {
    common::init_tracing();
    let hub = RelayHub::spawn(HubConfig::default());
    let mut a = hub.attach().await.unwrap();

    a.send(BridgeMessage::register("room", "peer-a"));
    assert_eq!(a.recv().await.unwrap().kind, BridgeKind::PeerJoin);

    a.send(BridgeMessage::send(
        "room",
        "peer-a",
        Some("peer-nobody".to_string()),
        json!(1),
    ));
    let err = a.recv().await.unwrap();
    assert_eq!(err.kind, BridgeKind::Error);
    assert_eq!(err.reason(), Some("unknown target"));
    assert_eq!(err.error_target(), Some("peer-nobody"));
}

#[tokio::test]
async fn unregistered_heartbeat_is_recoverable_by_reregistering() {
    common::init_tracing();
    let hub = RelayHub::spawn(HubConfig::default());
    let mut port = hub.attach().await.unwrap();

    port.send(BridgeMessage::heartbeat("room", "peer-a"));
    let err = port.recv().await.unwrap();
    assert_eq!(err.kind, BridgeKind::Error);
    assert_eq!(err.reason(), Some("not registered"));

    // The prescribed recovery: register, get the ack, carry on.
    port.send(BridgeMessage::register("room", "peer-a"));
    let ack = port.recv().await.unwrap();
    assert_eq!(ack.kind, BridgeKind::PeerJoin);
    assert_eq!(ack.player_id, "peer-a");
    assert!(ack.is_host_flag());

    port.send(BridgeMessage::heartbeat("room", "peer-a"));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.stats().await.unwrap().peers, 1);
}

#[tokio::test]
async fn explicit_leave_notifies_remaining_members() {
    common::init_tracing();
    let hub = RelayHub::spawn(HubConfig::default());
    let mut a = hub.attach().await.unwrap();
    let b = hub.attach().await.unwrap();

    a.send(BridgeMessage::register("room", "peer-a"));
    b.send(BridgeMessage::register("room", "peer-b"));

    // Drain a's join notifications (self, then peer-b).
    assert_eq!(a.recv().await.unwrap().player_id, "peer-a");
    assert_eq!(a.recv().await.unwrap().player_id, "peer-b");

    b.send(BridgeMessage::peer_leave("room", "peer-b", false, "leave"));
    let leave = a.recv().await.unwrap();
    assert_eq!(leave.kind, BridgeKind::PeerLeave);
    assert_eq!(leave.player_id, "peer-b");
    assert!(!leave.was_host_flag());
    assert_eq!(leave.reason(), Some("leave"));
}
