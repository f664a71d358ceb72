//! Shared helpers for the integration tests
#![allow(dead_code)]

use peerlink_core::events::EventIterator;
use peerlink_core::prelude::*;
use peerlink_core::transport::LoopbackTransport;
use std::sync::Arc;
use std::time::Duration;

/// One registered endpoint on a loopback network
pub struct Peer {
    pub manager: IdentityManager,
    pub endpoint: Arc<LoopbackTransport>,
    pub events: EventIterator,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("peerlink_core=debug")
        .with_test_writer()
        .try_init();
}

/// Register `name` on `network` with default configuration
pub async fn peer(network: &LoopbackNetwork, name: &str) -> Peer {
    peer_with_config(network, name, &PeerConfig::default()).await
}

pub async fn peer_with_config(network: &LoopbackNetwork, name: &str, config: &PeerConfig) -> Peer {
    let endpoint = network.endpoint_with_identity(name);
    let mut manager = IdentityManager::new(endpoint.clone(), config);
    let events = EventIterator::new(manager.events());
    manager
        .initialize()
        .await
        .expect("loopback registration should succeed");
    Peer {
        manager,
        endpoint,
        events,
    }
}

/// Everything emitted so far, waiting briefly for stragglers
pub async fn drain(events: &mut EventIterator) -> Vec<PeerEvent> {
    let mut out = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(20), events.next()).await {
        out.push(event);
    }
    out
}

/// `(previous, new)` pairs of every call state change in `events`
pub fn call_transitions(events: &[PeerEvent]) -> Vec<(CallState, CallState)> {
    events
        .iter()
        .filter_map(|e| match e {
            PeerEvent::CallStateChanged {
                previous, new_state, ..
            } => Some((*previous, *new_state)),
            _ => None,
        })
        .collect()
}

/// Texts and senders of a chat log, for compact assertions
pub fn transcript(messages: &[Message]) -> Vec<(String, Sender)> {
    messages.iter().map(|m| (m.text.clone(), m.sender)).collect()
}
