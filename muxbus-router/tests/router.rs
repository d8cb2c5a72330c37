mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use common::{join, join_echoing, start_router};
use muxbus_core::status::Code;
use muxbus_router::{
    ClientFilter, EnvelopeKind, RouterClient, RouterConfig, SystemEvent,
};

fn fast_health_config() -> RouterConfig {
    RouterConfig {
        health_interval: Duration::from_millis(30),
        client_timeout: Duration::from_millis(120),
        ..RouterConfig::default()
    }
}

#[tokio::test]
async fn unicast_reaches_only_the_target() {
    let (_server, connector) = start_router(RouterConfig::default());
    let (alice, alice_id, mut alice_rx) = join(&connector, "alice", Vec::new()).await;
    let (_bob, bob_id, mut bob_rx) = join(&connector, "bob", Vec::new()).await;

    alice.send_unicast(&bob_id, b"X".to_vec()).await.unwrap();

    let envelope = timeout(Duration::from_secs(1), bob_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.kind, EnvelopeKind::Unicast);
    assert_eq!(envelope.sender_id, alice_id);
    assert_eq!(envelope.payload, b"X");

    // No echo back to the sender.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn unicast_to_unknown_target_reports_not_found() {
    let (_server, connector) = start_router(RouterConfig::default());
    let (alice, _alice_id, mut alice_rx) = join(&connector, "alice", Vec::new()).await;

    alice
        .send_unicast("c-999999", b"X".to_vec())
        .await
        .unwrap();

    let envelope = timeout(Duration::from_secs(1), alice_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.kind, EnvelopeKind::Error);
    let error = envelope.routing_error().unwrap();
    assert_eq!(error.code(), Code::NotFound);
}

#[tokio::test]
async fn request_response_round_trip() {
    let (_server, connector) = start_router(RouterConfig::default());
    let (_bob, bob_id) = join_echoing(&connector, "bob").await;
    let (alice, _alice_id, _alice_rx) = join(&connector, "alice", Vec::new()).await;

    let reply = alice
        .send_request_with_correlation(&bob_id, "r-1", b"ping".to_vec(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply, b"ping:ack");

    // The pending entry is gone, so the same correlation id is usable
    // again.
    let reply = alice
        .send_request_with_correlation(&bob_id, "r-1", b"pong".to_vec(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply, b"pong:ack");
}

#[tokio::test]
async fn live_correlation_id_cannot_be_reused() {
    let (_server, connector) = start_router(RouterConfig::default());
    // charlie never answers, so the first request stays pending.
    let (_charlie, charlie_id, _charlie_rx) = join(&connector, "charlie", Vec::new()).await;
    let (alice, _alice_id, _alice_rx) = join(&connector, "alice", Vec::new()).await;

    let first = {
        let alice = Arc::clone(&alice);
        let charlie_id = charlie_id.clone();
        tokio::spawn(async move {
            alice
                .send_request_with_correlation(
                    &charlie_id,
                    "dup",
                    b"one".to_vec(),
                    Duration::from_millis(400),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = alice
        .send_request_with_correlation(&charlie_id, "dup", b"two".to_vec(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    let err = first.await.unwrap().unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn request_to_unknown_target_fails_with_not_found() {
    let (_server, connector) = start_router(RouterConfig::default());
    let (alice, _alice_id, _alice_rx) = join(&connector, "alice", Vec::new()).await;

    let err = alice
        .send_request("c-424242", b"ping".to_vec(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_the_sender() {
    let (_server, connector) = start_router(RouterConfig::default());
    let (alice, alice_id, mut alice_rx) = join(&connector, "alice", Vec::new()).await;
    let (_bob, _bob_id, mut bob_rx) = join(&connector, "bob", Vec::new()).await;
    let (_carol, _carol_id, mut carol_rx) = join(&connector, "carol", Vec::new()).await;

    alice.send_broadcast(b"news".to_vec()).await.unwrap();

    for rx in [&mut bob_rx, &mut carol_rx] {
        let envelope = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Broadcast);
        assert_eq!(envelope.sender_id, alice_id);
        assert_eq!(envelope.payload, b"news");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn multicast_targets_group_members_except_sender() {
    let (_server, connector) = start_router(RouterConfig::default());
    let (alice, _alice_id, mut alice_rx) =
        join(&connector, "alice", vec!["workers".to_string()]).await;
    let (_bob, _bob_id, mut bob_rx) = join(&connector, "bob", vec!["workers".to_string()]).await;
    let (_dave, _dave_id, mut dave_rx) = join(&connector, "dave", vec!["other".to_string()]).await;

    alice
        .send_multicast(vec!["workers".to_string()], b"shift".to_vec())
        .await
        .unwrap();

    let envelope = timeout(Duration::from_secs(1), bob_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.kind, EnvelopeKind::Multicast);
    assert_eq!(envelope.payload, b"shift");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(dave_rx.try_recv().is_err());
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn multicast_delivers_once_to_multi_group_members() {
    let (_server, connector) = start_router(RouterConfig::default());
    let (alice, _alice_id, _alice_rx) = join(&connector, "alice", Vec::new()).await;
    let (_bob, _bob_id, mut bob_rx) = join(
        &connector,
        "bob",
        vec!["g1".to_string(), "g2".to_string()],
    )
    .await;

    alice
        .send_multicast(vec!["g1".to_string(), "g2".to_string()], b"once".to_vec())
        .await
        .unwrap();

    let envelope = timeout(Duration::from_secs(1), bob_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.payload, b"once");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bob_rx.try_recv().is_err(), "delivered more than once");
}

#[tokio::test]
async fn explicit_client_id_collision_is_already_exists() {
    use muxbus_router::RegisterRequest;

    let (_server, connector) = start_router(RouterConfig::default());

    let first = RouterClient::new(connector.connect().await.unwrap());
    let response = first
        .register_request(RegisterRequest {
            client_name: "alice".into(),
            groups: Vec::new(),
            metadata: HashMap::new(),
            client_id: Some("pinned".into()),
        })
        .await
        .unwrap();
    assert_eq!(response.client_id, "pinned");

    let second = RouterClient::new(connector.connect().await.unwrap());
    let err = second
        .register_request(RegisterRequest {
            client_name: "impostor".into(),
            groups: Vec::new(),
            metadata: HashMap::new(),
            client_id: Some("pinned".into()),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);
}

#[tokio::test]
async fn health_loop_expires_silent_clients() {
    let (_server, connector) = start_router(fast_health_config());

    // Subscribe before alice joins; subscribers only see events from
    // subscription time forward.
    let observer = RouterClient::new(connector.connect().await.unwrap());
    let mut events = observer.subscribe_events().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (_alice, alice_id, mut alice_rx) = join(&connector, "alice", Vec::new()).await;

    // alice sends no heartbeats; the health loop removes her.
    let left = timeout(Duration::from_secs(3), async {
        loop {
            match events.message().await.unwrap() {
                Some(SystemEvent::ClientLeft { id, reason }) if id == alice_id => {
                    break reason;
                }
                Some(_) => continue,
                None => panic!("event stream ended early"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(left, "timeout");

    let online = observer
        .get_online_clients(ClientFilter::default())
        .await
        .unwrap();
    assert!(online.iter().all(|c| c.client_id != alice_id));

    // Her P2P stream is gone: the inbox sender was dropped with it.
    let closed = timeout(Duration::from_secs(2), alice_rx.recv()).await.unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn heartbeats_keep_a_client_alive() {
    let (_server, connector) = start_router(fast_health_config());
    let (alice, alice_id, _alice_rx) = join(&connector, "alice", Vec::new()).await;

    let beat = {
        let alice = Arc::clone(&alice);
        tokio::spawn(async move {
            loop {
                if alice.heartbeat().await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(40)).await;
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    let online = alice
        .get_online_clients(ClientFilter::default())
        .await
        .unwrap();
    assert!(online.iter().any(|c| c.client_id == alice_id));

    beat.abort();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let online = alice
            .get_online_clients(ClientFilter::default())
            .await
            .unwrap();
        if online.iter().all(|c| c.client_id != alice_id) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "client was never expired"
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}

#[tokio::test]
async fn metadata_update_is_visible_and_announced() {
    let (_server, connector) = start_router(RouterConfig::default());

    let observer = RouterClient::new(connector.connect().await.unwrap());
    let mut events = observer.subscribe_events().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (alice, alice_id, _alice_rx) = join(&connector, "alice", Vec::new()).await;

    let mut metadata = HashMap::new();
    metadata.insert("zone".to_string(), "eu-1".to_string());
    alice.update_metadata(metadata.clone()).await.unwrap();

    let updated = timeout(Duration::from_secs(2), async {
        loop {
            match events.message().await.unwrap() {
                Some(SystemEvent::ClientMetadataUpdated { id, metadata }) if id == alice_id => {
                    break metadata;
                }
                Some(_) => continue,
                None => panic!("event stream ended early"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(updated, metadata);

    let online = alice
        .get_online_clients(ClientFilter {
            name_prefix: Some("alice".into()),
            ..ClientFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].metadata, metadata);
}

#[tokio::test]
async fn ping_round_trips_the_nonce() {
    let (_server, connector) = start_router(RouterConfig::default());
    let (alice, _alice_id, _alice_rx) = join(&connector, "alice", Vec::new()).await;

    let pong = alice.ping("nonce-17").await.unwrap();
    assert_eq!(pong.nonce, "nonce-17");
    assert!(pong.server_time > 0);
}

#[tokio::test]
async fn p2p_before_register_fails_locally() {
    let (_server, connector) = start_router(RouterConfig::default());

    let client = RouterClient::new(connector.connect().await.unwrap());
    let err = client.init_p2p(|_| {}).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn p2p_with_unknown_sender_is_unauthenticated() {
    use muxbus_core::codec::JsonCodec;
    use muxbus_core::{CallOptions, CallerEndpoint};
    use muxbus_router::Envelope;

    let (_server, connector) = start_router(RouterConfig::default());

    // Drive the p2p method directly with a sender id the registry has
    // never seen.
    let endpoint = CallerEndpoint::new(connector.connect().await.unwrap());
    let mut call = endpoint
        .bidi(
            "Router",
            "p2p",
            JsonCodec::<Envelope>::new(),
            JsonCodec::<Envelope>::new(),
            CallOptions::new(),
        )
        .await
        .unwrap();
    call.send(&Envelope::heartbeat("c-bogus")).await.unwrap();

    let err = call.message().await.unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn server_shutdown_disconnects_clients() {
    let (server, connector) = start_router(RouterConfig::default());
    let (alice, _alice_id, mut alice_rx) = join(&connector, "alice", Vec::new()).await;

    server.shutdown().await;

    // The P2P stream terminates once the endpoints close.
    let closed = timeout(Duration::from_secs(2), alice_rx.recv()).await.unwrap();
    assert!(closed.is_none());

    let err = alice.heartbeat().await.unwrap_err();
    assert!(matches!(
        err.code(),
        Code::Unavailable | Code::Cancelled | Code::FailedPrecondition
    ));
}
