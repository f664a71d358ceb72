//! In-process loopback transport
//!
//! A [`LoopbackNetwork`] plays the role of the signaling service: it assigns
//! identities and links endpoints that live in the same process. Channels and calls
//! are pairs of unbounded queues, so ordering within one handle is exactly the
//! order in which the other side produced events.
//!
//! Used by the integration tests and the demo CLI; it performs no NAT traversal and
//! never touches the network.

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    CallEvent, CallHandle, CallLink, ChannelEvent, ChannelHandle, DataChannel, IncomingCall,
    IncomingConnection, PeerTransport, TransportError, TransportResult,
};
use crate::identity::PeerIdentity;
use crate::media::MediaStream;

/// Length of generated identities (hex characters)
const GENERATED_IDENTITY_LEN: usize = 16;

fn generate_identity() -> PeerIdentity {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    PeerIdentity::new(&raw[..GENERATED_IDENTITY_LEN])
}

/// Shared registry of loopback endpoints
#[derive(Debug, Clone)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Debug)]
struct NetworkInner {
    endpoints: DashMap<PeerIdentity, Arc<EndpointState>>,
    online: AtomicBool,
}

impl LoopbackNetwork {
    /// Create an empty, online network
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: DashMap::new(),
                online: AtomicBool::new(true),
            }),
        }
    }

    /// Create an endpoint that receives a generated identity on registration
    pub fn endpoint(&self) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport::new(self.inner.clone(), None))
    }

    /// Create an endpoint that asks for a specific identity on registration
    pub fn endpoint_with_identity(&self, identity: impl Into<String>) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport::new(
            self.inner.clone(),
            Some(PeerIdentity::new(identity)),
        ))
    }

    /// Take the signaling service on- or offline; offline registrations fail
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Whether `identity` is currently registered
    pub fn is_registered(&self, identity: &str) -> bool {
        self.inner.endpoints.contains_key(&PeerIdentity::new(identity))
    }

    /// Number of registered endpoints
    pub fn registered_count(&self) -> usize {
        self.inner.endpoints.len()
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-endpoint state shared between the endpoint and the network registry
#[derive(Debug, Default)]
struct EndpointState {
    identity: Mutex<Option<PeerIdentity>>,
    connections_tx: Mutex<Option<mpsc::UnboundedSender<IncomingConnection>>>,
    calls_tx: Mutex<Option<mpsc::UnboundedSender<IncomingCall>>>,
    channels: Mutex<Vec<Arc<ChannelPipe>>>,
    calls: Mutex<Vec<Arc<CallPipe>>>,
    destroyed: AtomicBool,
}

impl EndpointState {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn track_channel(&self, pipe: &Arc<ChannelPipe>) {
        let mut channels = self.channels.lock();
        channels.retain(|p| !p.is_closed());
        channels.push(pipe.clone());
    }

    fn track_call(&self, pipe: &Arc<CallPipe>) {
        let mut calls = self.calls.lock();
        calls.retain(|p| !p.is_closed());
        calls.push(pipe.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Initiator,
    Acceptor,
}

#[derive(Debug)]
struct ChannelPipe {
    closed: AtomicBool,
    initiator_tx: mpsc::UnboundedSender<ChannelEvent>,
    acceptor_tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelPipe {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sender delivering to the side opposite `from`
    fn peer_of(&self, from: Side) -> &mpsc::UnboundedSender<ChannelEvent> {
        match from {
            Side::Initiator => &self.acceptor_tx,
            Side::Acceptor => &self.initiator_tx,
        }
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.initiator_tx.send(ChannelEvent::Closed);
            let _ = self.acceptor_tx.send(ChannelEvent::Closed);
        }
    }
}

#[derive(Debug)]
struct LoopbackChannel {
    remote: PeerIdentity,
    side: Side,
    pipe: Arc<ChannelPipe>,
}

impl DataChannel for LoopbackChannel {
    fn remote(&self) -> &PeerIdentity {
        &self.remote
    }

    fn send(&self, payload: Bytes) -> TransportResult<()> {
        if self.pipe.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        self.pipe
            .peer_of(self.side)
            .send(ChannelEvent::Data(payload))
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&self) {
        if !self.pipe.closed.swap(true, Ordering::AcqRel) {
            debug!("Loopback channel to {} closed locally", self.remote.short());
            let _ = self.pipe.peer_of(self.side).send(ChannelEvent::Closed);
        }
    }
}

#[derive(Debug)]
struct CallPipe {
    closed: AtomicBool,
    answered: AtomicBool,
    caller_tx: mpsc::UnboundedSender<CallEvent>,
    callee_tx: mpsc::UnboundedSender<CallEvent>,
    offer: MediaStream,
}

impl CallPipe {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn peer_of(&self, from: Side) -> &mpsc::UnboundedSender<CallEvent> {
        match from {
            Side::Initiator => &self.callee_tx,
            Side::Acceptor => &self.caller_tx,
        }
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.caller_tx.send(CallEvent::Closed);
            let _ = self.callee_tx.send(CallEvent::Closed);
        }
    }
}

#[derive(Debug)]
struct LoopbackCall {
    remote: PeerIdentity,
    side: Side,
    pipe: Arc<CallPipe>,
}

impl CallLink for LoopbackCall {
    fn remote(&self) -> &PeerIdentity {
        &self.remote
    }

    fn answer(&self, local: MediaStream) -> TransportResult<()> {
        if self.side == Side::Initiator {
            return Err(TransportError::Rejected {
                reason: "only the called side can answer".to_string(),
            });
        }
        if self.pipe.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        if self.pipe.answered.swap(true, Ordering::AcqRel) {
            return Err(TransportError::Rejected {
                reason: "call already answered".to_string(),
            });
        }

        // Each side receives the other's stream
        self.pipe
            .caller_tx
            .send(CallEvent::Stream(local))
            .map_err(|_| TransportError::ChannelClosed)?;
        let _ = self.pipe.callee_tx.send(CallEvent::Stream(self.pipe.offer.clone()));
        Ok(())
    }

    fn close(&self) {
        if !self.pipe.closed.swap(true, Ordering::AcqRel) {
            debug!("Loopback call with {} closed locally", self.remote.short());
            let _ = self.pipe.peer_of(self.side).send(CallEvent::Closed);
        }
    }
}

/// One endpoint on a [`LoopbackNetwork`]
#[derive(Debug)]
pub struct LoopbackTransport {
    network: Arc<NetworkInner>,
    requested: Option<PeerIdentity>,
    state: Arc<EndpointState>,
}

impl LoopbackTransport {
    fn new(network: Arc<NetworkInner>, requested: Option<PeerIdentity>) -> Self {
        Self {
            network,
            requested,
            state: Arc::new(EndpointState::default()),
        }
    }

    /// Identity assigned by the last successful registration
    pub fn identity(&self) -> Option<PeerIdentity> {
        self.state.identity.lock().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.is_destroyed()
    }

    /// Channels involving this endpoint that are not yet closed
    pub fn open_channels(&self) -> usize {
        self.state.channels.lock().iter().filter(|p| !p.is_closed()).count()
    }

    /// Calls involving this endpoint that are not yet closed
    pub fn open_calls(&self) -> usize {
        self.state.calls.lock().iter().filter(|p| !p.is_closed()).count()
    }

    fn local_identity(&self) -> TransportResult<PeerIdentity> {
        if self.state.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        self.identity().ok_or(TransportError::NotRegistered)
    }

    fn lookup(&self, remote: &PeerIdentity) -> TransportResult<Arc<EndpointState>> {
        self.network
            .endpoints
            .get(remote)
            .map(|entry| entry.value().clone())
            .filter(|peer| !peer.is_destroyed())
            .ok_or_else(|| TransportError::PeerUnavailable {
                peer: remote.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl PeerTransport for LoopbackTransport {
    async fn register(&self) -> TransportResult<PeerIdentity> {
        if self.state.is_destroyed() {
            return Err(TransportError::Destroyed);
        }

        // Registration is a round trip to the signaling service
        tokio::task::yield_now().await;

        if !self.network.online.load(Ordering::Acquire) {
            return Err(TransportError::Unreachable {
                reason: "signaling service is offline".to_string(),
            });
        }
        if let Some(existing) = self.identity() {
            return Ok(existing);
        }

        let identity = self.requested.clone().unwrap_or_else(generate_identity);
        match self.network.endpoints.entry(identity.clone()) {
            Entry::Occupied(_) => {
                return Err(TransportError::IdentityTaken {
                    identity: identity.to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(self.state.clone());
            }
        }
        *self.state.identity.lock() = Some(identity.clone());

        info!("Loopback endpoint registered as {}", identity);
        Ok(identity)
    }

    async fn connect(&self, remote: &PeerIdentity) -> TransportResult<ChannelHandle> {
        let local = self.local_identity()?;
        let peer = self.lookup(remote)?;

        let (initiator_tx, initiator_rx) = mpsc::unbounded_channel();
        let (acceptor_tx, acceptor_rx) = mpsc::unbounded_channel();
        let pipe = Arc::new(ChannelPipe {
            closed: AtomicBool::new(false),
            initiator_tx,
            acceptor_tx,
        });

        let inbound = IncomingConnection {
            channel: Arc::new(LoopbackChannel {
                remote: local,
                side: Side::Acceptor,
                pipe: pipe.clone(),
            }),
            events: acceptor_rx,
        };

        // Open is queued ahead of anything the acceptor may send once it holds the channel
        let _ = pipe.initiator_tx.send(ChannelEvent::Open);
        let delivered = peer
            .connections_tx
            .lock()
            .as_ref()
            .map(|tx| tx.send(inbound).is_ok())
            .unwrap_or(false);
        if !delivered {
            return Err(TransportError::PeerUnavailable {
                peer: remote.to_string(),
            });
        }

        self.state.track_channel(&pipe);
        peer.track_channel(&pipe);

        // Signaling round trip
        tokio::task::yield_now().await;

        debug!("Loopback channel opened towards {}", remote.short());
        Ok(ChannelHandle {
            channel: Arc::new(LoopbackChannel {
                remote: remote.clone(),
                side: Side::Initiator,
                pipe,
            }),
            events: initiator_rx,
        })
    }

    fn incoming_connections(&self) -> mpsc::UnboundedReceiver<IncomingConnection> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.state.is_destroyed() {
            *self.state.connections_tx.lock() = Some(tx);
        }
        rx
    }

    async fn call(&self, remote: &PeerIdentity, local: MediaStream) -> TransportResult<CallHandle> {
        let local_identity = self.local_identity()?;
        let peer = self.lookup(remote)?;

        let (caller_tx, caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, callee_rx) = mpsc::unbounded_channel();
        let pipe = Arc::new(CallPipe {
            closed: AtomicBool::new(false),
            answered: AtomicBool::new(false),
            caller_tx,
            callee_tx,
            offer: local,
        });

        let inbound = IncomingCall {
            link: Arc::new(LoopbackCall {
                remote: local_identity,
                side: Side::Acceptor,
                pipe: pipe.clone(),
            }),
            events: callee_rx,
        };
        let delivered = peer
            .calls_tx
            .lock()
            .as_ref()
            .map(|tx| tx.send(inbound).is_ok())
            .unwrap_or(false);
        if !delivered {
            return Err(TransportError::PeerUnavailable {
                peer: remote.to_string(),
            });
        }

        self.state.track_call(&pipe);
        peer.track_call(&pipe);
        tokio::task::yield_now().await;

        debug!("Loopback call placed towards {}", remote.short());
        Ok(CallHandle {
            link: Arc::new(LoopbackCall {
                remote: remote.clone(),
                side: Side::Initiator,
                pipe,
            }),
            events: caller_rx,
        })
    }

    fn incoming_calls(&self) -> mpsc::UnboundedReceiver<IncomingCall> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.state.is_destroyed() {
            *self.state.calls_tx.lock() = Some(tx);
        }
        rx
    }

    fn destroy(&self) {
        if self.state.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let identity = self.state.identity.lock().take();
        if let Some(identity) = &identity {
            self.network.endpoints.remove(identity);
        }

        let channels: Vec<_> = self.state.channels.lock().drain(..).collect();
        for pipe in channels {
            pipe.shutdown();
        }
        let calls: Vec<_> = self.state.calls.lock().drain(..).collect();
        for pipe in calls {
            pipe.shutdown();
        }

        *self.state.connections_tx.lock() = None;
        *self.state.calls_tx.lock() = None;

        info!(
            "Loopback endpoint {} destroyed",
            identity.as_ref().map(|i| i.as_str()).unwrap_or("<unregistered>")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};

    async fn registered_pair(network: &LoopbackNetwork) -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        let a = network.endpoint_with_identity("alice");
        let b = network.endpoint_with_identity("bob");
        a.register().await.unwrap();
        b.register().await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_generated_identity_and_offline_registration() {
        let network = LoopbackNetwork::new();
        let endpoint = network.endpoint();
        let identity = endpoint.register().await.unwrap();
        assert_eq!(identity.as_str().len(), GENERATED_IDENTITY_LEN);
        assert!(network.is_registered(identity.as_str()));

        // Registering again returns the same identity
        assert_eq!(endpoint.register().await.unwrap(), identity);

        network.set_online(false);
        let err = network.endpoint().register().await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let network = LoopbackNetwork::new();
        network.endpoint_with_identity("abc123").register().await.unwrap();
        let err = network
            .endpoint_with_identity("abc123")
            .register()
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::IdentityTaken {
                identity: "abc123".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_channel_open_data_and_close() {
        let network = LoopbackNetwork::new();
        let (a, b) = registered_pair(&network).await;
        let mut inbound_rx = b.incoming_connections();

        let mut outbound = a.connect(&PeerIdentity::new("bob")).await.unwrap();
        let mut inbound = inbound_rx.recv().await.unwrap();
        assert_eq!(inbound.remote().as_str(), "alice");
        assert_eq!(outbound.events.recv().await, Some(ChannelEvent::Open));

        outbound.channel.send(Bytes::from_static(b"hi")).unwrap();
        inbound.channel.send(Bytes::from_static(b"yo")).unwrap();
        assert_eq!(inbound.events.recv().await, Some(ChannelEvent::Data(Bytes::from_static(b"hi"))));
        assert_eq!(outbound.events.recv().await, Some(ChannelEvent::Data(Bytes::from_static(b"yo"))));

        inbound.channel.close();
        inbound.channel.close();
        assert_eq!(outbound.events.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(
            outbound.channel.send(Bytes::from_static(b"late")),
            Err(TransportError::ChannelClosed)
        );
        assert_eq!(a.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_open_precedes_acceptor_data() {
        let network = LoopbackNetwork::new();
        let (a, b) = registered_pair(&network).await;
        let mut inbound_rx = b.incoming_connections();

        let bob_id = PeerIdentity::new("bob");
        let (outbound, inbound) = tokio::join!(a.connect(&bob_id), async {
            let inbound = inbound_rx.recv().await.unwrap();
            inbound.channel.send(Bytes::from_static(b"first")).unwrap();
            inbound
        });
        let mut outbound = outbound.unwrap();

        assert_eq!(inbound.remote().as_str(), "alice");
        assert_eq!(outbound.events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(
            outbound.events.recv().await,
            Some(ChannelEvent::Data(Bytes::from_static(b"first")))
        );
    }

    #[tokio::test]
    async fn test_connect_to_unknown_peer() {
        let network = LoopbackNetwork::new();
        let (a, _b) = registered_pair(&network).await;
        let err = a.connect(&PeerIdentity::new("nobody")).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::PeerUnavailable {
                peer: "nobody".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_call_answer_exchanges_streams() {
        let network = LoopbackNetwork::new();
        let (a, b) = registered_pair(&network).await;
        let mut calls_rx = b.incoming_calls();

        let offer = MediaStream::new(vec![MediaTrack::new(TrackKind::Audio, "a-mic")]);
        let mut outbound = a.call(&PeerIdentity::new("bob"), offer.clone()).await.unwrap();
        let mut inbound = calls_rx.recv().await.unwrap();

        assert!(outbound.link.answer(offer.clone()).is_err());

        let answer = MediaStream::new(vec![MediaTrack::new(TrackKind::Audio, "b-mic")]);
        inbound.link.answer(answer.clone()).unwrap();
        assert!(inbound.link.answer(answer.clone()).is_err());

        match outbound.events.recv().await {
            Some(CallEvent::Stream(stream)) => assert_eq!(stream.id(), answer.id()),
            other => panic!("unexpected event: {:?}", other),
        }
        match inbound.events.recv().await {
            Some(CallEvent::Stream(stream)) => assert_eq!(stream.id(), offer.id()),
            other => panic!("unexpected event: {:?}", other),
        }

        outbound.link.close();
        assert!(matches!(inbound.events.recv().await, Some(CallEvent::Closed)));
    }

    #[tokio::test]
    async fn test_destroy_closes_everything() {
        let network = LoopbackNetwork::new();
        let (a, b) = registered_pair(&network).await;
        let mut inbound_rx = b.incoming_connections();
        let _calls_rx = b.incoming_calls();

        let mut outbound = a.connect(&PeerIdentity::new("bob")).await.unwrap();
        let mut inbound = inbound_rx.recv().await.unwrap();
        let mut call = a
            .call(&PeerIdentity::new("bob"), MediaStream::new(Vec::new()))
            .await
            .unwrap();

        b.destroy();
        b.destroy();

        assert!(!network.is_registered("bob"));
        assert!(b.is_destroyed());
        assert_eq!(outbound.events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(outbound.events.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(inbound.events.recv().await, Some(ChannelEvent::Closed));
        assert!(matches!(call.events.recv().await, Some(CallEvent::Closed)));
        assert!(inbound_rx.recv().await.is_none());
        assert_eq!(b.register().await, Err(TransportError::Destroyed));
    }
}
