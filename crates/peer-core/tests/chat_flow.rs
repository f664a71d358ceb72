//! Chat session behavior over the loopback transport

mod common;

use bytes::Bytes;
use common::{drain, peer, peer_with_config, transcript};
use peerlink_core::config::ChatConfig;
use peerlink_core::prelude::*;
use peerlink_core::ConnectionDirection;

async fn open_pair(initiator: &mut ChatSession, acceptor: &mut ChatSession, target: &str) {
    initiator.connect(target).await.unwrap();
    assert_eq!(acceptor.process_next().await, Some(ChannelState::Open));
    assert_eq!(initiator.process_next().await, Some(ChannelState::Open));
}

#[tokio::test]
async fn one_local_message_per_non_blank_send() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, "alice").await;
    let bob = peer(&network, "bob").await;
    let mut a = ChatSession::new(alice.manager.handle(), ChatConfig::default());
    let mut b = ChatSession::new(bob.manager.handle(), ChatConfig::default());
    open_pair(&mut a, &mut b, "bob").await;

    let inputs = ["one", "   ", "", "  two  ", "\n", "three"];
    let appended: Vec<bool> = inputs.iter().map(|text| a.send(text)).collect();
    assert_eq!(appended, vec![true, false, false, true, false, true]);

    // Untrimmed text is what gets logged and transmitted
    let expected = vec![
        ("one".to_string(), Sender::Local),
        ("  two  ".to_string(), Sender::Local),
        ("three".to_string(), Sender::Local),
    ];
    assert_eq!(transcript(a.messages()), expected);

    for _ in 0..3 {
        b.process_next().await;
    }
    let received: Vec<&str> = b.messages().iter().map(|m| m.text.as_str()).collect();
    assert_eq!(received, vec!["one", "  two  ", "three"]);
    assert!(b.messages().iter().all(|m| m.sender == Sender::Peer));
}

#[tokio::test]
async fn send_while_pending_or_closed_is_ignored() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, "alice").await;
    let bob = peer(&network, "bob").await;
    let mut a = ChatSession::new(alice.manager.handle(), ChatConfig::default());
    let mut b = ChatSession::new(bob.manager.handle(), ChatConfig::default());

    a.connect("bob").await.unwrap();
    assert!(!a.send("too early"));

    b.process_next().await;
    a.process_next().await;
    b.close();
    assert_eq!(a.process_next().await, Some(ChannelState::Closed));

    assert!(!a.send("too late"));
    assert!(a.messages().is_empty());
    assert!(b.messages().is_empty());
}

#[tokio::test]
async fn empty_and_invalid_payloads_are_still_received() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, "alice").await;
    let raw = network.endpoint_with_identity("raw");
    raw.register().await.unwrap();

    let mut a = ChatSession::new(alice.manager.handle(), ChatConfig::default());
    let handle = raw.connect(&PeerIdentity::new("alice")).await.unwrap();
    assert_eq!(a.process_next().await, Some(ChannelState::Open));

    handle.channel.send(Bytes::new()).unwrap();
    handle.channel.send(Bytes::from_static(&[0x68, 0x69, 0xff])).unwrap();
    a.process_next().await;
    a.process_next().await;

    let texts: Vec<&str> = a.messages().iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["", "hi\u{fffd}"]);
}

#[tokio::test]
async fn inbound_connection_replaces_open_one_by_default() {
    let network = LoopbackNetwork::new();
    let mut alice = peer(&network, "alice").await;
    let bob = peer(&network, "bob").await;
    let carol = peer(&network, "carol").await;

    let mut a = ChatSession::new(alice.manager.handle(), ChatConfig::default());
    let mut b = ChatSession::new(bob.manager.handle(), ChatConfig::default());
    let mut c = ChatSession::new(carol.manager.handle(), ChatConfig::default());

    open_pair(&mut b, &mut a, "alice").await;
    open_pair(&mut c, &mut a, "alice").await;

    assert_eq!(a.remote().map(|r| r.as_str()), Some("carol"));
    assert_eq!(a.connection().map(|c| c.direction()), Some(ConnectionDirection::Accepted));

    // Bob's channel was closed by the replacement
    assert_eq!(b.process_next().await, Some(ChannelState::Closed));

    let events = drain(&mut alice.events).await;
    let closed_bob = events.iter().any(|e| {
        matches!(e, PeerEvent::ConnectionStateChanged { remote, new_state: ChannelState::Closed, .. }
            if remote.as_str() == "bob")
    });
    assert!(closed_bob);
}

#[tokio::test]
async fn reject_while_open_keeps_existing_connection() {
    let network = LoopbackNetwork::new();
    let config = PeerConfig::builder()
        .chat(|chat| chat.inbound_policy(InboundPolicy::RejectWhileOpen))
        .build()
        .unwrap();
    let alice = peer_with_config(&network, "alice", &config).await;
    let bob = peer(&network, "bob").await;
    let carol = peer(&network, "carol").await;

    let mut a = ChatSession::new(alice.manager.handle(), config.chat.clone());
    let mut b = ChatSession::new(bob.manager.handle(), ChatConfig::default());
    let mut c = ChatSession::new(carol.manager.handle(), ChatConfig::default());

    open_pair(&mut b, &mut a, "alice").await;

    c.connect("alice").await.unwrap();
    assert_eq!(a.process_next().await, Some(ChannelState::Open));
    assert_eq!(a.remote().map(|r| r.as_str()), Some("bob"));

    // Carol sees her channel open and then closed
    assert_eq!(c.process_next().await, Some(ChannelState::Open));
    assert_eq!(c.process_next().await, Some(ChannelState::Closed));

    assert!(b.send("still here"));
    a.process_next().await;
    assert_eq!(a.messages()[0].text, "still here");
}

#[tokio::test]
async fn connect_while_open_is_rejected_and_pending_is_superseded() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, "alice").await;
    let bob = peer(&network, "bob").await;
    let carol = peer(&network, "carol").await;

    let mut a = ChatSession::new(alice.manager.handle(), ChatConfig::default());
    let mut b = ChatSession::new(bob.manager.handle(), ChatConfig::default());
    let mut c = ChatSession::new(carol.manager.handle(), ChatConfig::default());

    // A second attempt replaces the pending one
    a.connect("bob").await.unwrap();
    a.connect("carol").await.unwrap();
    assert_eq!(a.remote().map(|r| r.as_str()), Some("carol"));
    assert_eq!(b.process_next().await, Some(ChannelState::Open));
    assert_eq!(b.process_next().await, Some(ChannelState::Closed));

    assert_eq!(c.process_next().await, Some(ChannelState::Open));
    assert_eq!(a.process_next().await, Some(ChannelState::Open));

    let err = a.connect("bob").await.unwrap_err();
    assert!(matches!(err, PeerError::InvalidState { .. }));
    assert_eq!(a.remote().map(|r| r.as_str()), Some("carol"));

    // After a local close a new connection is allowed
    a.close();
    a.close();
    assert_eq!(a.state(), ChannelState::Closed);
    a.connect("bob").await.unwrap();
    assert_eq!(a.state(), ChannelState::Pending);
}

#[tokio::test]
async fn reply_sent_right_after_accepting_reaches_initiator() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, "alice").await;
    let bob = peer(&network, "bob").await;
    let mut a = ChatSession::new(alice.manager.handle(), ChatConfig::default());
    let mut b = ChatSession::new(bob.manager.handle(), ChatConfig::default());

    // Bob accepts and answers while Alice's connect is still in flight
    let (connected, (bob_state, sent)) = tokio::join!(a.connect("bob"), async {
        let state = b.process_next().await;
        (state, b.send("hello alice"))
    });
    connected.unwrap();
    assert_eq!(bob_state, Some(ChannelState::Open));
    assert!(sent);

    assert_eq!(a.process_next().await, Some(ChannelState::Open));
    assert_eq!(a.process_next().await, Some(ChannelState::Open));
    assert_eq!(
        transcript(a.messages()),
        vec![("hello alice".to_string(), Sender::Peer)]
    );
}
