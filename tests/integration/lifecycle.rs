//! Keep-alive, disconnects, shutdown and admission.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use peerwire_core::wire::p2p;
use peerwire_core::DisconnectReason;
use peerwire_services::{ChannelSender, Direction, SessionError, SessionState};

use crate::*;

#[tokio::test]
async fn initialized_sessions_exchange_pings() {
    let a = NodeBuilder::new(0xa1)
        .keep_alive(Duration::from_millis(30))
        .build();
    let b = NodeBuilder::new(0xb2)
        .keep_alive(Duration::from_millis(30))
        .build();
    let link = connect(&a, &b);

    wait_for_chain_peers(&a, &b).await;
    let pinged = wait_until(Duration::from_secs(2), || {
        link.a_pings.load(Ordering::Relaxed) >= 2 && link.b_pings.load(Ordering::Relaxed) >= 2
    })
    .await;
    assert!(pinged, "keep-alive pings were not sent");

    // Pongs keep the sessions healthy.
    assert_eq!(
        a.manager.session(link.a_session).unwrap().state,
        SessionState::Initialized
    );

    let a_pings = Arc::clone(&link.a_pings);
    a.manager.disconnect(link.a_session, DisconnectReason::DisconnectRequested);
    let (a_session, _) = link.finish().await;
    assert!(!a_session.has_keep_alive());

    let after = a_pings.load(Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(a_pings.load(Ordering::Relaxed), after);
}

#[tokio::test]
async fn disconnect_cleans_up_exactly_once() {
    let a = NodeBuilder::new(0xa1).build();
    let b = NodeBuilder::new(0xb2).build();
    let link = connect(&a, &b);
    wait_for_chain_peers(&a, &b).await;
    let id = link.a_session;

    assert!(a.manager.disconnect(id, DisconnectReason::DisconnectRequested));
    let (a_session, b_session) = link.finish().await;

    assert_eq!(
        a_session.disconnect_reason(),
        Some(DisconnectReason::DisconnectRequested)
    );
    // b heard the reason from a.
    assert_eq!(
        b_session.disconnect_reason(),
        Some(DisconnectReason::DisconnectRequested)
    );

    // The session is gone; further requests are no-ops.
    assert!(!a.manager.disconnect(id, DisconnectReason::DisconnectRequested));
    assert_eq!(a.manager.session_count(), 0);
    assert!(!a.manager.is_connected(&b.id));

    assert!(!a.sync.contains(&b.id));
    assert_eq!(a.sync.removals(), 1);
    assert_eq!(a.txpool.removals(), 1);
    assert_eq!(a.sync_remove_calls(), 1);
    assert_eq!(a.txpool_remove_calls(), 1);
    assert_eq!(b.sync.removals(), 1);

    let stats = a.manager.stats().get(&b.id).unwrap();
    assert_eq!(stats.last_disconnect, Some(DisconnectReason::DisconnectRequested));
}

#[tokio::test]
async fn shutdown_ends_both_sides() {
    let a = NodeBuilder::new(0xa1).build();
    let b = NodeBuilder::new(0xb2).build();
    let link = connect(&a, &b);
    wait_for_chain_peers(&a, &b).await;

    link.shutdown.send(()).unwrap();
    let (a_session, b_session) = link.finish().await;

    assert_eq!(a_session.disconnect_reason(), Some(DisconnectReason::ClientQuitting));
    assert_eq!(b_session.disconnect_reason(), Some(DisconnectReason::ClientQuitting));
    assert!(a.sync.is_empty());
    assert!(b.sync.is_empty());
}

#[tokio::test]
async fn second_connection_from_same_node_is_refused() {
    let a = NodeBuilder::new(0xa1).build();
    let b = NodeBuilder::new(0xb2).build();
    let link = connect(&a, &b);
    wait_for_chain_peers(&a, &b).await;

    let (sender, mut out) = ChannelSender::pair(4);
    let err = a
        .manager
        .accept_connection(meta(b.id, Direction::Inbound), Arc::new(sender))
        .unwrap_err();
    assert!(matches!(err, SessionError::AlreadyConnected));
    assert_eq!(out.recv().await.map(|p| p.code), Some(p2p::DISCONNECT));
    assert!(out.recv().await.is_none());

    // The established session is untouched.
    assert_eq!(a.manager.session_count(), 1);
    assert!(a.sync.contains(&b.id));

    link.shutdown.send(()).unwrap();
    link.finish().await;
}

#[tokio::test]
async fn full_peer_table_refuses_new_connections() {
    let a = NodeBuilder::new(0xa1).max_peers(1).build();
    let b = NodeBuilder::new(0xb2).build();
    let link = connect(&a, &b);

    let (sender, mut out) = ChannelSender::pair(4);
    let err = a
        .manager
        .accept_connection(meta(node_id(0xc3), Direction::Inbound), Arc::new(sender))
        .unwrap_err();
    assert!(matches!(err, SessionError::TooManyPeers));
    assert_eq!(out.recv().await.map(|p| p.code), Some(p2p::DISCONNECT));
    assert!(a.manager.stats().get(&node_id(0xc3)).is_none());

    link.shutdown.send(()).unwrap();
    link.finish().await;
}
