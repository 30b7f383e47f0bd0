//! End-to-end broadcast behavior over memory endpoints
//!
//! Memory endpoints keep message boundaries, so zero-length keepalives and
//! per-message ordering are observable exactly.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::*;
use pipecast::{IdleTimeout, MemoryClient, ServerConfig, SlotState};

#[tokio::test]
async fn test_echo_reaches_siblings_and_consumer_but_not_sender() {
    let mut t = TestServer::start(2, true, IdleTimeout::Forever).await;
    let mut a = t.connect().await;
    let mut b = t.connect().await;

    a.send("hello").await.unwrap();

    assert_eq!(recv(&mut b).await, Bytes::from_static(b"hello"));
    let forwarded = t.next_forwarded().await;
    assert_eq!(forwarded.payload, Bytes::from_static(b"hello"));
    assert_eq!(&forwarded.origin, t.server.id());
    assert!(recv_within(&mut a, Duration::from_millis(100)).await.is_none());

    t.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_echo_off_forwards_only() {
    let mut t = TestServer::start(2, false, IdleTimeout::Forever).await;
    let a = t.connect().await;
    let mut b = t.connect().await;

    a.send("private").await.unwrap();
    assert_eq!(t.next_forwarded().await.payload, Bytes::from_static(b"private"));
    assert!(recv_within(&mut b, Duration::from_millis(100)).await.is_none());

    t.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_forwards_keep_per_client_order() {
    let mut t = TestServer::start(2, false, IdleTimeout::Forever).await;
    let a = t.connect().await;

    for i in 0..20 {
        a.send(format!("msg-{}", i)).await.unwrap();
    }
    for i in 0..20 {
        let forwarded = t.next_forwarded().await;
        assert_eq!(forwarded.payload, Bytes::from(format!("msg-{}", i)));
    }

    t.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disconnected_slot_accepts_new_client_without_touching_others() {
    let mut t = TestServer::start(2, true, IdleTimeout::Forever).await;
    let a = t.connect().await;
    let mut b = t.connect().await;

    drop(a);
    let after = wait_for_connected(&t.server, 1).await;
    let survivor = after.iter().find(|s| s.is_connected()).unwrap().clone();
    let recycled = after.iter().find(|s| !s.is_connected()).unwrap().clone();
    assert_eq!(recycled.state, SlotState::Connecting);
    assert!(recycled.pending);
    assert!(recycled.peer.is_none());

    let a2 = t.connect().await;
    a2.send("again").await.unwrap();
    assert_eq!(recv(&mut b).await, Bytes::from_static(b"again"));
    assert_eq!(t.next_forwarded().await.payload, Bytes::from_static(b"again"));

    let last = t.server.status().await.unwrap();
    assert_eq!(last[survivor.slot.index()], survivor);
    assert!(last[recycled.slot.index()].is_connected());

    t.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_send_reaches_connected_clients_and_skips_free_slots() {
    let t = TestServer::start(3, false, IdleTimeout::Forever).await;
    let mut a = t.connect().await;
    let mut b = t.connect().await;

    t.server.send("ping").await.unwrap();

    assert_eq!(recv(&mut a).await, Bytes::from_static(b"ping"));
    assert_eq!(recv(&mut b).await, Bytes::from_static(b"ping"));
    let status = t.server.status().await.unwrap();
    assert_eq!(status.iter().filter(|s| !s.is_connected()).count(), 1);
    assert!(status.iter().all(|s| s.pending));
}

#[tokio::test]
async fn test_idle_server_sends_empty_keepalives() {
    let mut t = TestServer::start(2, false, IdleTimeout::After(Duration::from_millis(50))).await;
    let mut a = t.connect().await;

    for _ in 0..3 {
        let keepalive = recv_within(&mut a, Duration::from_millis(500))
            .await
            .expect("keepalive within the idle window");
        assert!(keepalive.is_empty());
    }
    assert!(t.server.is_running());

    // Traffic still flows after timeouts
    a.send("awake").await.unwrap();
    assert_eq!(t.next_forwarded().await.payload, Bytes::from_static(b"awake"));

    t.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_keepalives_reach_every_slot_after_one_goes_quiet() {
    let mut t = TestServer::start(2, false, IdleTimeout::After(Duration::from_millis(50))).await;
    let mut a = t.connect().await;
    let mut b = t.connect().await;

    for word in ["one", "two", "three"] {
        a.send(word).await.unwrap();
        assert_eq!(t.next_forwarded().await.payload, Bytes::from(word));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    drain(&mut a);
    drain(&mut b);

    // Both clients are nudged in every idle window, not just the one that talked
    tokio::time::sleep(Duration::from_millis(330)).await;
    let to_a = drain(&mut a);
    let to_b = drain(&mut b);
    assert!(to_a.len() >= 3, "a got {} keepalives", to_a.len());
    assert!(to_b.len() >= 3, "b got {} keepalives", to_b.len());
    assert!(to_a.len().abs_diff(to_b.len()) <= 1);
    assert!(to_a.iter().chain(&to_b).all(Bytes::is_empty));

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_send_burst_reaches_reading_client_in_full() {
    let mut t = TestServer::start(1, false, IdleTimeout::Forever).await;
    let mut client = t.connect().await;

    let reader = tokio::spawn(async move {
        let mut received = Vec::new();
        while received.len() < 200 {
            match recv_within(&mut client, PATIENCE).await {
                Some(msg) => received.push(msg),
                None => break,
            }
        }
        received
    });
    for i in 0..200 {
        t.server.send(format!("m{}", i)).await.unwrap();
    }

    let received = reader.await.unwrap();
    let expected: Vec<Bytes> = (0..200).map(|i| Bytes::from(format!("m{}", i))).collect();
    assert_eq!(received, expected);

    t.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_echo_burst_reaches_reading_sibling_in_full() {
    let mut config = ServerConfig::default().with_capacity(2);
    config.write_queue_depth = 2;
    let mut t = TestServer::start_with(config, true, IdleTimeout::Forever).await;
    let talker = t.connect().await;
    let mut listener = t.connect().await;

    for i in 0..100 {
        talker.send(format!("e{}", i)).await.unwrap();
    }
    for i in 0..100 {
        assert_eq!(recv(&mut listener).await, Bytes::from(format!("e{}", i)));
    }

    t.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_client_that_stopped_reading() {
    let mut config = ServerConfig::default().with_capacity(1);
    config.write_queue_depth = 4;
    config.write_stall_timeout_ms = 100;
    let mut t = TestServer::start_with(config, false, IdleTimeout::Forever).await;
    let mut client = t.connect().await;

    for _ in 0..400 {
        t.server.send("unread").await.unwrap();
    }
    tokio::time::timeout(PATIENCE, t.server.shutdown())
        .await
        .expect("shutdown finished")
        .unwrap();

    let mut received = 0;
    while let Some(msg) = recv_within(&mut client, PATIENCE).await {
        assert_eq!(msg, Bytes::from_static(b"unread"));
        received += 1;
    }
    assert!(received < 400);
    let closed = tokio::time::timeout(Duration::from_millis(50), client.recv())
        .await
        .expect("connection closed");
    assert!(closed.is_none());
}

#[tokio::test]
async fn test_extra_client_waits_for_a_free_slot() {
    let mut t = TestServer::start(2, false, IdleTimeout::Forever).await;
    let a = t.connect().await;
    let _b = t.connect().await;

    // Queued on the listener until a slot frees up
    let c = MemoryClient::connect(&t.endpoint).unwrap();
    c.send("from c").await.unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(100), t.forwarded.recv())
        .await
        .is_err());

    drop(a);
    assert_eq!(t.next_forwarded().await.payload, Bytes::from_static(b"from c"));

    t.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_clients_and_releases_endpoint() {
    let mut t = TestServer::start(2, false, IdleTimeout::Forever).await;
    let mut a = t.connect().await;

    t.server.shutdown().await.unwrap();

    assert!(recv_within(&mut a, Duration::from_secs(1)).await.is_none());
    assert!(MemoryClient::connect(&t.endpoint).is_err());
    assert!(t.server.send("late").await.is_err());
}

#[tokio::test]
async fn test_server_linked_downstream_of_another() {
    let mut upstream = TestServer::start(1, false, IdleTimeout::Forever).await;
    let downstream = TestServer::start(1, false, IdleTimeout::Forever).await;
    upstream
        .server
        .link(std::sync::Arc::new(downstream.server.handle().unwrap()));

    let talker = upstream.connect().await;
    let mut listener = downstream.connect().await;

    talker.send("relayed").await.unwrap();
    assert_eq!(recv(&mut listener).await, Bytes::from_static(b"relayed"));
    assert_eq!(
        upstream.next_forwarded().await.payload,
        Bytes::from_static(b"relayed")
    );
}
