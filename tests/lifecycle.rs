//! Peer and host lifecycle: graceful disconnects, dispose idempotency,
//! ack timeouts against a dead remote, shutdown and send_all.

mod common;

use common::*;
use peerlink::{DisconnectReason, Host, HostConfig, OutgoingMessage, PeerConfig};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn graceful_disconnect_notifies_both_sides() {
    let config = PeerConfig {
        disconnect_delay: Duration::from_millis(100),
        ..quiet_peer_config()
    };
    let mut pair = connect_pair(config.clone(), config).await;

    pair.peer_a.disconnect().await;

    match wait_for(&mut pair.events_a, |event| match event {
        PeerEvent::Disconnect(reason, _) => Some(reason),
        _ => None,
    })
    .await
    {
        DisconnectReason::Disconnected => {}
        other => panic!("initiator saw {other:?}"),
    }

    match wait_for(&mut pair.events_b, |event| match event {
        PeerEvent::Disconnect(reason, _) => Some(reason),
        _ => None,
    })
    .await
    {
        DisconnectReason::Terminated => {}
        other => panic!("remote saw {other:?}"),
    }
    assert!(pair.peer_a.is_disposed());
    assert!(pair.peer_b.is_disposed());
}

#[tokio::test(flavor = "multi_thread")]
async fn dispose_is_idempotent() {
    let mut pair = connect_pair(quiet_peer_config(), quiet_peer_config()).await;

    for _ in 0..5 {
        pair.peer_a.dispose().await;
    }

    match next_event(&mut pair.events_a).await {
        PeerEvent::Disconnect(DisconnectReason::Disposed, _) => {}
        other => panic!("expected Disposed, got {other:?}"),
    }

    // no further terminal callbacks
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pair.events_a.try_recv().is_err());

    // sending on a disposed peer fails cleanly
    assert!(pair.peer_a.send(OutgoingMessage::new("x")).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_remote_triggers_timeout_disconnect() {
    let config = PeerConfig {
        ping_delay: Duration::from_millis(50),
        resend_count: 4,
        resend_delay_min: Duration::from_millis(60),
        resend_delay_max: Duration::from_millis(120),
        resend_delay_jitter: Duration::from_millis(10),
        send_delay: Duration::from_millis(5),
        ..PeerConfig::default()
    };
    let mut pair = connect_pair(config.clone(), config).await;

    // the remote vanishes without a word
    pair.host_b.dispose().await;

    let reason = wait_for(&mut pair.events_a, |event| match event {
        PeerEvent::Disconnect(reason, _) => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, DisconnectReason::Timeout);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_disconnects_peers_and_notifies() {
    let config = PeerConfig {
        disconnect_delay: Duration::from_millis(100),
        ..quiet_peer_config()
    };
    let mut pair = connect_pair(config.clone(), config).await;

    pair.host_a.shutdown().await;

    let reason = wait_for(&mut pair.events_a, |event| match event {
        PeerEvent::Disconnect(reason, _) => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, DisconnectReason::Disconnected);

    let mut host_events_a = pair.host_events_a;
    wait_for(&mut host_events_a, |event| matches!(event, HostEvent::Shutdown).then_some(()))
        .await;

    // the remote observes the announced disconnect
    let reason = wait_for(&mut pair.events_b, |event| match event {
        PeerEvent::Disconnect(reason, _) => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, DisconnectReason::Terminated);
}

#[tokio::test(flavor = "multi_thread")]
async fn send_all_skips_excluded_peers() {
    let (listener_a, _host_events_a) = host_listener();
    let (listener_b, mut host_events_b) = host_listener();
    let (listener_c, mut host_events_c) = host_listener();

    let no_crypto = HostConfig { encryption: false, ..HostConfig::default() };
    let host_a = Host::new(no_crypto.clone(), listener_a).await.unwrap();
    let host_b = Host::new(no_crypto.clone(), listener_b).await.unwrap();
    let host_c = Host::new(no_crypto, listener_c).await.unwrap();

    // connect A to both B and C
    let (pl_ab, mut events_ab) = peer_listener();
    let peer_ab = host_a
        .connect(local_addr_of(&host_b), quiet_peer_config(), pl_ab, None)
        .await
        .unwrap();
    let request = wait_for(&mut host_events_b, |event| match event {
        HostEvent::Request(request, _) => Some(request),
        _ => None,
    })
    .await;
    let (pl_b, mut events_b) = peer_listener();
    host_b.accept(&request, quiet_peer_config(), pl_b).await.unwrap();

    let (pl_ac, mut events_ac) = peer_listener();
    let peer_ac = host_a
        .connect(local_addr_of(&host_c), quiet_peer_config(), pl_ac, None)
        .await
        .unwrap();
    let request = wait_for(&mut host_events_c, |event| match event {
        HostEvent::Request(request, _) => Some(request),
        _ => None,
    })
    .await;
    let (pl_c, mut events_c) = peer_listener();
    host_c.accept(&request, quiet_peer_config(), pl_c).await.unwrap();

    wait_for(&mut events_ab, |event| matches!(event, PeerEvent::Connect).then_some(())).await;
    wait_for(&mut events_ac, |event| matches!(event, PeerEvent::Connect).then_some(())).await;

    host_a
        .send_all(
            OutgoingMessage::new("fanout").reliable().unique(),
            &[peer_ac.remote_endpoint()],
        )
        .await;

    let payload = wait_for(&mut events_b, |event| match event {
        PeerEvent::Receive(payload, _) => Some(payload),
        _ => None,
    })
    .await;
    assert_eq!(&payload[..], b"fanout");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let got_message = std::iter::from_fn(|| events_c.try_recv().ok())
        .any(|event| matches!(event, PeerEvent::Receive(_, _)));
    assert!(!got_message, "excluded peer received the fanout");
    drop(peer_ab);
}
