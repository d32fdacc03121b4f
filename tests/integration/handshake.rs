//! Base and chain handshakes between two managers.

use std::sync::Arc;

use num_bigint::BigUint;
use tokio::sync::mpsc;

use peerwire_core::wire::{p2p, Hello};
use peerwire_core::{Capability, DisconnectReason, JsonCodec, P2pMessage, PacketCodec};
use peerwire_services::{
    ChannelSender, Direction, FailedCompatibilityValidation, SessionDriver, SessionState,
};

use crate::*;

#[tokio::test]
async fn peers_complete_both_handshakes() {
    let a = NodeBuilder::new(0xa1).chain(chain(1, 1_000)).build();
    let b = NodeBuilder::new(0xb2).chain(chain(1, 2_000)).build();
    let link = connect(&a, &b);

    wait_for_chain_peers(&a, &b).await;

    let a_view = a.manager.session(link.a_session).unwrap();
    assert_eq!(a_view.state, SessionState::Initialized);
    assert!(a_view.ready);
    assert_eq!(a_view.p2p_version, Some(5));
    assert_eq!(a_view.client_id.as_deref(), Some("peerwire/test-b2"));
    assert!(b.manager.session(link.b_session).unwrap().ready);

    let stats = a.manager.stats().get(&b.id).unwrap();
    assert_eq!(stats.eth_version, Some(68));
    assert_eq!(stats.network_id, Some(1));
    assert_eq!(stats.genesis_hash, Some(GENESIS));
    assert_eq!(stats.total_difficulty, Some(BigUint::from(2_000u32)));
    assert_eq!(
        stats.failed_compatibility_validation,
        FailedCompatibilityValidation::None
    );
    assert_eq!(stats.handshakes, 1);
    assert_eq!(stats.validated_handshakes, 1);

    let peer = a.sync.get(&b.id).unwrap();
    assert_eq!(peer.peer.eth_version, 68);
    assert_eq!(peer.peer.client_id, "peerwire/test-b2");
    assert!(a.txpool.contains(&b.id));

    assert!(a.manager.disconnect(link.a_session, DisconnectReason::DisconnectRequested));
    link.finish().await;
}

#[tokio::test]
async fn highest_common_eth_version_is_selected() {
    let a = NodeBuilder::new(0xa1).build();
    let b = NodeBuilder::new(0xb2).eth_versions(&[66, 67]).build();
    let link = connect(&a, &b);

    wait_for_chain_peers(&a, &b).await;

    assert_eq!(a.manager.get_highest_protocol_version("eth"), Some(68));
    assert_eq!(b.manager.get_highest_protocol_version("eth"), Some(67));
    assert_eq!(a.manager.stats().get(&b.id).unwrap().eth_version, Some(67));
    assert_eq!(b.manager.stats().get(&a.id).unwrap().eth_version, Some(67));
    assert_eq!(a.sync.get(&b.id).unwrap().peer.eth_version, 67);

    link.shutdown.send(()).unwrap();
    link.finish().await;
}

#[tokio::test]
async fn eth66_only_peer_is_accepted() {
    let a = NodeBuilder::new(0xa1).build();
    let b = NodeBuilder::new(0xb2).eth_versions(&[66]).build();
    let link = connect(&a, &b);

    wait_for_chain_peers(&a, &b).await;
    assert_eq!(a.manager.stats().get(&b.id).unwrap().eth_version, Some(66));

    link.shutdown.send(()).unwrap();
    link.finish().await;
}

#[tokio::test]
async fn peer_without_shared_eth_version_is_useless() {
    let a = NodeBuilder::new(0xa1).build();
    let b = NodeBuilder::new(0xb2).eth_versions(&[65]).build();
    let link = connect(&a, &b);

    let (a_session, _) = link.finish().await;
    assert_eq!(a_session.state(), SessionState::Disconnected);
    assert_eq!(a_session.disconnect_reason(), Some(DisconnectReason::UselessPeer));

    let stats = a.manager.stats().get(&b.id).unwrap();
    assert_eq!(
        stats.failed_compatibility_validation,
        FailedCompatibilityValidation::MissingChainCapability
    );
    assert_eq!(stats.last_disconnect, Some(DisconnectReason::UselessPeer));
    assert!(!a.sync.contains(&b.id));
    assert_eq!(a.sync.removals(), 0);
    // No handler was attached, yet both pools were told the peer left.
    assert_eq!(a.sync_remove_calls(), 1);
    assert_eq!(a.txpool_remove_calls(), 1);
    assert_eq!(a.manager.session_count(), 0);
}

#[tokio::test]
async fn network_id_mismatch_is_recorded() {
    let a = NodeBuilder::new(0xa1).chain(chain(1, 1_000)).build();
    let b = NodeBuilder::new(0xb2).chain(chain(5, 1_000)).build();
    let link = connect(&a, &b);

    let (a_session, b_session) = link.finish().await;
    assert_eq!(
        a_session.disconnect_reason(),
        Some(DisconnectReason::SubprotocolSpecific)
    );
    assert_eq!(
        b_session.disconnect_reason(),
        Some(DisconnectReason::SubprotocolSpecific)
    );

    let stats = a.manager.stats().get(&b.id).unwrap();
    assert_eq!(
        stats.failed_compatibility_validation,
        FailedCompatibilityValidation::NetworkId
    );
    assert_eq!(stats.validated_handshakes, 0);
    assert!(a.sync.is_empty());
    assert!(a.txpool.is_empty());
    assert_eq!(a.sync_remove_calls(), 1);
    assert_eq!(a.txpool_remove_calls(), 1);
    assert!(!a.manager.is_connected(&b.id));
}

#[tokio::test]
async fn old_p2p_version_is_rejected() {
    let a = NodeBuilder::new(0xa1).build();
    let remote = node_id(0xc3);

    // Left over from an earlier session with the same node.
    a.manager
        .stats()
        .record_disconnect(&remote, DisconnectReason::DisconnectRequested);

    let (sender, mut out) = ChannelSender::pair(16);
    let session = a
        .manager
        .accept_connection(meta(remote, Direction::Inbound), Arc::new(sender))
        .unwrap();
    let (inbound_tx, inbound_rx) = mpsc::channel(16);
    let (_shutdown, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let driver = SessionDriver::new(session, inbound_rx, HANDSHAKE_TIMEOUT, shutdown_rx);

    let hello = JsonCodec
        .encode_p2p(&P2pMessage::Hello(Hello {
            p2p_version: 3,
            client_id: "ancient/0.1".into(),
            capabilities: vec![Capability::new("eth", 68)],
            listen_port: 30303,
            node_id: remote,
        }))
        .unwrap();
    inbound_tx.send(hello).await.unwrap();

    let session = driver.run().await;
    assert_eq!(
        session.disconnect_reason(),
        Some(DisconnectReason::IncompatibleP2PProtocolVersion)
    );

    let stats = a.manager.stats().get(&remote).unwrap();
    assert_eq!(stats.p2p_version, Some(3));
    assert_eq!(stats.client_id.as_deref(), Some("ancient/0.1"));
    assert_eq!(
        stats.failed_compatibility_validation,
        FailedCompatibilityValidation::ProtocolVersion
    );
    assert_eq!(
        stats.last_disconnect,
        Some(DisconnectReason::IncompatibleP2PProtocolVersion)
    );

    // Our Hello, then the Disconnect; nothing chain-related was sent.
    let mut codes = Vec::new();
    while let Some(packet) = out.recv().await {
        codes.push(packet.code);
    }
    assert_eq!(codes, vec![p2p::HELLO, p2p::DISCONNECT]);
}
