// SPDX-License-Identifier: MIT OR Apache-2.0

//! Delivery semantics over the mesh: targeting, broadcast, loopback
//! filtering, liveness eviction, and disconnect silence.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::sleep;

use partynet_network::mesh::{HostRole, MeshConfig, MeshTransport};
use partynet_network::{ConnectionState, LocalMedium, PlayerId, Transport, WireMessage};

fn config(room: &str, player: &str) -> MeshConfig {
    MeshConfig {
        player_id: Some(player.to_string()),
        heartbeat_interval: Duration::from_secs(1),
        peer_timeout: Duration::from_secs(5),
        discovery_window: Duration::from_secs(2),
        ..MeshConfig::for_room(room)
    }
}

fn collect_messages(transport: &MeshTransport) -> Arc<Mutex<Vec<(PlayerId, Value)>>> {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    transport.on_message(Box::new(move |payload, sender| {
        sink.lock().push((sender.clone(), payload.clone()));
    }));
    messages
}

#[tokio::test(start_paused = true)]
async fn broadcast_reaches_everyone_else_exactly_once() {
    common::init_tracing();
    let medium = LocalMedium::new();
    let a = MeshTransport::join(&medium, config("arena", "peer-a"));
    let b = MeshTransport::join(&medium, config("arena", "peer-b"));
    let c = MeshTransport::join(&medium, config("arena", "peer-c"));

    let a_msgs = collect_messages(&a);
    let b_msgs = collect_messages(&b);
    let c_msgs = collect_messages(&c);

    // First heartbeats introduce everyone to everyone.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(a.peer_ids(), vec!["peer-b".to_string(), "peer-c".to_string()]);

    a.send(json!({"n": 1}), None);
    sleep(Duration::from_millis(200)).await;

    assert_eq!(
        b_msgs.lock().as_slice(),
        &[("peer-a".to_string(), json!({"n": 1}))]
    );
    assert_eq!(
        c_msgs.lock().as_slice(),
        &[("peer-a".to_string(), json!({"n": 1}))]
    );
    // Loopback is filtered.
    assert!(a_msgs.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn targeted_send_reaches_only_the_target() {
    common::init_tracing();
    let medium = LocalMedium::new();
    let a = MeshTransport::join(&medium, config("arena", "peer-a"));
    let b = MeshTransport::join(&medium, config("arena", "peer-b"));
    let c = MeshTransport::join(&medium, config("arena", "peer-c"));

    let b_msgs = collect_messages(&b);
    let c_msgs = collect_messages(&c);

    sleep(Duration::from_millis(500)).await;
    a.send(json!("secret"), Some("peer-b"));
    sleep(Duration::from_millis(200)).await;

    assert_eq!(
        b_msgs.lock().as_slice(),
        &[("peer-a".to_string(), json!("secret"))]
    );
    assert!(c_msgs.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unknown_target_surfaces_through_error_handlers() {
    common::init_tracing();
    let medium = LocalMedium::new();
    let a = MeshTransport::join(&medium, config("arena", "peer-a"));

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    a.on_error(Box::new(move |err| {
        sink.lock().push(err.to_string());
    }));

    a.send(json!(1), Some("peer-nobody"));

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("unknown peer: peer-nobody"));
}

#[tokio::test(start_paused = true)]
async fn host_departure_fires_host_disconnect_once_and_never_reelects() {
    common::init_tracing();
    let medium = LocalMedium::new();
    let host = MeshTransport::join(
        &medium,
        MeshConfig {
            role: HostRole::Host,
            ..config("arena", "peer-h")
        },
    );
    let peer = MeshTransport::join(&medium, config("arena", "peer-b"));

    let leaves = Arc::new(Mutex::new(Vec::new()));
    let leave_sink = leaves.clone();
    peer.on_peer_leave(Box::new(move |id| {
        leave_sink.lock().push(id.clone());
    }));
    let host_losses = Arc::new(Mutex::new(0u32));
    let loss_sink = host_losses.clone();
    peer.on_host_disconnect(Box::new(move || {
        *loss_sink.lock() += 1;
    }));

    sleep(Duration::from_secs(1)).await;
    assert_eq!(peer.host_id(), Some("peer-h".to_string()));

    host.disconnect();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(leaves.lock().as_slice(), &["peer-h".to_string()]);
    assert_eq!(*host_losses.lock(), 1);
    assert_eq!(peer.connection_state(), ConnectionState::Disconnected);

    // Sticky host: nobody inherits the role.
    sleep(Duration::from_secs(10)).await;
    assert!(!peer.is_host());
    assert_eq!(*host_losses.lock(), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_evicted_exactly_once() {
    common::init_tracing();
    let medium = LocalMedium::new();
    let transport = MeshTransport::join(&medium, config("arena", "peer-b"));

    let joins = Arc::new(Mutex::new(Vec::new()));
    let join_sink = joins.clone();
    transport.on_peer_join(Box::new(move |id| {
        join_sink.lock().push(id.clone());
    }));
    let leaves = Arc::new(Mutex::new(Vec::new()));
    let leave_sink = leaves.clone();
    transport.on_peer_leave(Box::new(move |id| {
        leave_sink.lock().push(id.clone());
    }));

    // One heartbeat, then silence: a crashed peer cannot say goodbye.
    let ghost = medium.join("partynet", "arena");
    ghost
        .tx
        .send(WireMessage::heartbeat("peer-ghost", None).encode().unwrap())
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(joins.lock().as_slice(), &["peer-ghost".to_string()]);

    sleep(Duration::from_secs(20)).await;
    assert_eq!(leaves.lock().as_slice(), &["peer-ghost".to_string()]);
    assert!(transport.peer_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_silences_every_handler() {
    common::init_tracing();
    let medium = LocalMedium::new();
    let a = MeshTransport::join(&medium, config("arena", "peer-a"));
    let b = MeshTransport::join(&medium, config("arena", "peer-b"));
    sleep(Duration::from_millis(500)).await;

    let fired = Arc::new(Mutex::new(0u32));
    let msg_sink = fired.clone();
    b.on_message(Box::new(move |_, _| {
        *msg_sink.lock() += 1;
    }));
    let join_sink = fired.clone();
    b.on_peer_join(Box::new(move |_| {
        *join_sink.lock() += 1;
    }));
    let leave_sink = fired.clone();
    b.on_peer_leave(Box::new(move |_| {
        *leave_sink.lock() += 1;
    }));
    let loss_sink = fired.clone();
    b.on_host_disconnect(Box::new(move || {
        *loss_sink.lock() += 1;
    }));

    b.disconnect();
    b.disconnect(); // idempotent

    // Throw everything at the disconnected transport.
    a.send(json!(1), None);
    let raw = medium.join("partynet", "arena");
    raw.tx
        .send(WireMessage::heartbeat("peer-new", None).encode().unwrap())
        .unwrap();
    raw.tx
        .send(
            WireMessage::leave("peer-a", Some("gone".to_string()))
                .encode()
                .unwrap(),
        )
        .unwrap();
    sleep(Duration::from_secs(5)).await;

    assert_eq!(*fired.lock(), 0);
    assert_eq!(b.connection_state(), ConnectionState::Disconnected);
    assert!(b.peer_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped_without_breaking_the_session() {
    common::init_tracing();
    let medium = LocalMedium::new();
    let transport = MeshTransport::join(&medium, config("arena", "peer-b"));
    let messages = collect_messages(&transport);

    let raw = medium.join("partynet", "arena");
    raw.tx.send("{ not json".to_string()).unwrap();
    raw.tx
        .send(r#"{"type":"warp","senderId":"x","timestamp":1}"#.to_string())
        .unwrap();
    raw.tx
        .send(
            WireMessage::action("peer-a", None, json!({"ok": true}))
                .encode()
                .unwrap(),
        )
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    let messages = messages.lock();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].1, json!({"ok": true}));
}
