//! Pub/sub and request/response between peers over loopback UDP.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::StreamExt;
use whisper_integration_tests::{peer, settle};
use whisper_net::{BrokerConfig, Channel, Kind, Message, PeerConfig, WhisperError};

// ============================================================================
// Helper Functions
// ============================================================================

/// Subscribes `pattern` on `peer` and queues every delivered message.
fn collect(peer: &whisper_net::Peer, pattern: &str) -> Channel<Message> {
    let out = Channel::new();
    let tx = out.clone();
    peer.subscribe(pattern, move |message: Message| {
        let tx = tx.clone();
        async move { tx.send(message).map(|()| None) }
    })
    .unwrap();
    out
}

async fn next(channel: &Channel<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(2), channel.recv())
        .await
        .expect("timed out waiting for message")
        .unwrap()
}

// ============================================================================
// Publish
// ============================================================================

#[tokio::test]
async fn direct_publish_delivers_payload() {
    let a = peer(PeerConfig::default()).await.unwrap();
    let b = peer(PeerConfig::default()).await.unwrap();
    let inbox = collect(&b, "greetings");

    a.connect(&[b.node().clone()]).await.unwrap();
    settle().await;

    let replies = a
        .publish("greetings", Message::new().with_payload(b"hello".to_vec()), Some(&[b.id()]))
        .await
        .unwrap();

    let got = next(&inbox).await;
    assert_eq!(got.id, replies.message_id());
    assert_eq!(got.topic, "greetings");
    assert_eq!(got.payload, b"hello");
    assert_eq!(got.routing.src, Some(a.id()));

    drop(replies);
    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test]
async fn gossip_publish_matches_glob_subscriptions() {
    let a = peer(PeerConfig::default()).await.unwrap();
    let b = peer(PeerConfig::default()).await.unwrap();
    let c = peer(PeerConfig::default()).await.unwrap();
    let on_b = collect(&b, "metrics.*");
    let on_c = collect(&c, "metrics.*");
    let ignored = collect(&c, "logs.*");

    a.connect(&[b.node().clone(), c.node().clone()]).await.unwrap();
    settle().await;

    let replies = a
        .publish("metrics.cpu", Message::new().with_payload(b"42".to_vec()), None)
        .await
        .unwrap();

    assert_eq!(next(&on_b).await.id, replies.message_id());
    assert_eq!(next(&on_c).await.id, replies.message_id());
    settle().await;
    assert!(ignored.is_empty());

    drop(replies);
    a.disconnect().await;
    b.disconnect().await;
    c.disconnect().await;
}

#[tokio::test]
async fn syn_publish_is_acknowledged_once() {
    let quick = BrokerConfig::default().with_reply_timeout(Duration::from_millis(500));
    let a = peer(PeerConfig::default().with_broker(quick)).await.unwrap();
    let b = peer(PeerConfig::default()).await.unwrap();
    a.connect(&[b.node().clone()]).await.unwrap();
    settle().await;

    let replies = a
        .publish("ping", Message::new().with_kind(Kind::Syn), Some(&[b.id()]))
        .await
        .unwrap();
    let id = replies.message_id();
    let acks = replies.collect().await.unwrap();

    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].id, id);
    assert!(acks[0].has(Kind::Ack));
    assert_eq!(acks[0].routing.src, Some(b.id()));
    assert_eq!(acks[0].routing.dst, Some(a.id()));

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test]
async fn publish_reaches_peer_two_hops_away() {
    let a = peer(PeerConfig::default()).await.unwrap();
    let b = peer(PeerConfig::default()).await.unwrap();
    let c = peer(PeerConfig::default()).await.unwrap();
    let inbox = collect(&a, "test");

    a.connect(&[b.node().clone()]).await.unwrap();
    settle().await;
    b.connect(&[c.node().clone()]).await.unwrap();
    settle().await;

    let replies = c
        .publish("test", Message::new().with_payload(b"hi".to_vec()), Some(&[a.id()]))
        .await
        .unwrap();

    let got = next(&inbox).await;
    assert_eq!(got.id, replies.message_id());
    assert_eq!(got.payload, b"hi");
    assert_eq!(got.routing.src, Some(c.id()));
    let hops: Vec<_> = got.routing.nodes().collect();
    assert_eq!(hops, vec![c.id(), b.id(), a.id()]);

    drop(replies);
    a.disconnect().await;
    b.disconnect().await;
    c.disconnect().await;
}

#[tokio::test]
async fn publish_to_unknown_peer_fails() {
    let a = peer(PeerConfig::default()).await.unwrap();
    let stranger = whisper_net::NodeId::new();

    let err = a
        .publish("t", Message::new(), Some(&[stranger]))
        .await
        .unwrap_err();
    assert!(matches!(err, WhisperError::NodeNotFound(id) if id == stranger));
    assert!(a.broker().topics().is_empty(), "correlation left behind");

    a.disconnect().await;
}

// ============================================================================
// Request / Response
// ============================================================================

#[tokio::test]
async fn request_yields_response() {
    let a = peer(PeerConfig::default()).await.unwrap();
    let b = peer(PeerConfig::default()).await.unwrap();
    b.respond("echo", |message: Message| async move {
        Ok(Some(Message::new().with_payload([b"re: ".as_slice(), message.payload.as_slice()].concat())))
    })
    .unwrap();

    a.connect(&[b.node().clone()]).await.unwrap();
    settle().await;

    let replies = a
        .request(
            "echo",
            Message::new().with_payload(b"ping".to_vec()),
            Some(&[b.id()]),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    let id = replies.message_id();
    let responses = replies.collect().await.unwrap();

    assert_eq!(responses.len(), 1);
    let response = &responses[0];
    assert_eq!(response.id, id);
    assert!(response.has(Kind::Response));
    assert_eq!(response.topic, "echo");
    assert_eq!(response.payload, b"re: ping");
    assert_eq!(response.routing.src, Some(b.id()));

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test]
async fn gossiped_request_collects_until_deadline() {
    let a = peer(PeerConfig::default()).await.unwrap();
    let b = peer(PeerConfig::default()).await.unwrap();
    let c = peer(PeerConfig::default()).await.unwrap();
    for responder in [&b, &c] {
        responder
            .respond("who", |_| async { Ok(Some(Message::new())) })
            .unwrap();
    }

    a.connect(&[b.node().clone(), c.node().clone()]).await.unwrap();
    settle().await;

    let replies = a
        .request("who", Message::new(), None, Duration::from_millis(500))
        .await
        .unwrap();
    let messages: Vec<Message> = replies
        .into_stream()
        .map(|reply| reply.unwrap())
        .collect()
        .await;

    let senders = |kind: Kind| -> BTreeSet<_> {
        messages
            .iter()
            .filter(|m| m.has(kind))
            .filter_map(|m| m.routing.src)
            .collect()
    };
    assert_eq!(senders(Kind::Ack), BTreeSet::from([b.id(), c.id()]));
    assert_eq!(senders(Kind::Response), BTreeSet::from([b.id(), c.id()]));

    a.disconnect().await;
    b.disconnect().await;
    c.disconnect().await;
}

#[tokio::test]
async fn request_to_silent_peer_times_out_empty() {
    let a = peer(PeerConfig::default()).await.unwrap();
    let b = peer(PeerConfig::default()).await.unwrap();
    a.connect(&[b.node().clone()]).await.unwrap();
    settle().await;

    let replies = a
        .request("nobody", Message::new(), Some(&[b.id()]), Duration::from_millis(200))
        .await
        .unwrap();
    assert!(replies.collect().await.unwrap().is_empty());
    assert!(a.broker().topics().is_empty());

    a.disconnect().await;
    b.disconnect().await;
}
