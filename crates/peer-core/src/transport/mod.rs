//! Signaling/transport seam
//!
//! The session core never negotiates network paths itself. Everything it needs from
//! the signaling service and the peer-to-peer transport is expressed by
//! [`PeerTransport`]: registration of a local identity, opening a reliable ordered
//! data channel, placing/answering media calls, and process-wide notifications for
//! inbound channels and calls.
//!
//! Instead of named callbacks, every handle comes with an ordered event receiver.
//! Events for one channel or call are delivered in transport order; nothing is
//! promised across handles.

pub mod loopback;

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::identity::PeerIdentity;
use crate::media::MediaStream;

pub use loopback::{LoopbackNetwork, LoopbackTransport};

/// Transport-level failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The signaling service could not be reached
    #[error("signaling service unreachable: {reason}")]
    Unreachable { reason: String },

    /// The requested identity is already in use on the signaling service
    #[error("identity {identity} is already registered")]
    IdentityTaken { identity: String },

    /// Operation requires a registered identity
    #[error("transport is not registered")]
    NotRegistered,

    /// The transport handle has been destroyed
    #[error("transport has been destroyed")]
    Destroyed,

    /// The remote identity is not reachable through the signaling service
    #[error("peer {peer} is unavailable")]
    PeerUnavailable { peer: String },

    /// The channel or call is already closed
    #[error("channel is closed")]
    ChannelClosed,

    /// The remote side or the transport refused the request
    #[error("request rejected: {reason}")]
    Rejected { reason: String },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Events for one data channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The channel finished negotiation and can carry data
    Open,
    /// A payload from the remote endpoint
    Data(Bytes),
    /// Negotiation or delivery failed; the channel is unusable
    Error(String),
    /// The remote endpoint (or the transport) closed the channel
    Closed,
}

/// Events for one media call
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The remote media stream arrived
    Stream(MediaStream),
    /// The call failed at the transport level
    Error(String),
    /// The remote endpoint hung up (or the transport closed the call)
    Closed,
}

/// One end of a reliable ordered data channel
pub trait DataChannel: Send + Sync + fmt::Debug {
    /// Identity of the endpoint on the other side
    fn remote(&self) -> &PeerIdentity;

    /// Queue a payload for delivery; does not wait for the remote side
    fn send(&self, payload: Bytes) -> TransportResult<()>;

    /// Close the channel; calling it more than once has no further effect
    fn close(&self);
}

/// One end of a media call
pub trait CallLink: Send + Sync + fmt::Debug {
    /// Identity of the endpoint on the other side
    fn remote(&self) -> &PeerIdentity;

    /// Answer an inbound call with the local stream
    fn answer(&self, local: MediaStream) -> TransportResult<()>;

    /// Hang up; calling it more than once has no further effect
    fn close(&self);
}

/// A data channel together with its ordered event stream
#[derive(Debug)]
pub struct ChannelHandle {
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelHandle {
    pub fn remote(&self) -> &PeerIdentity {
        self.channel.remote()
    }
}

/// A call together with its ordered event stream
#[derive(Debug)]
pub struct CallHandle {
    pub link: Arc<dyn CallLink>,
    pub events: mpsc::UnboundedReceiver<CallEvent>,
}

impl CallHandle {
    pub fn remote(&self) -> &PeerIdentity {
        self.link.remote()
    }
}

/// A channel opened by a remote peer
pub type IncomingConnection = ChannelHandle;

/// A call placed by a remote peer, not yet answered
pub type IncomingCall = CallHandle;

/// Signaling service plus peer-to-peer transport
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync + fmt::Debug {
    /// Register with the signaling service and obtain the local identity
    async fn register(&self) -> TransportResult<PeerIdentity>;

    /// Open a reliable ordered channel to `remote`
    ///
    /// Success means the request was accepted by the signaling layer; the channel
    /// reports [`ChannelEvent::Open`] once it can carry data.
    async fn connect(&self, remote: &PeerIdentity) -> TransportResult<ChannelHandle>;

    /// Subscribe to channels opened by remote peers
    fn incoming_connections(&self) -> mpsc::UnboundedReceiver<IncomingConnection>;

    /// Place a media call to `remote`, offering `local`
    async fn call(&self, remote: &PeerIdentity, local: MediaStream) -> TransportResult<CallHandle>;

    /// Subscribe to calls placed by remote peers
    fn incoming_calls(&self) -> mpsc::UnboundedReceiver<IncomingCall>;

    /// Release the transport: unregister and close every channel and call
    fn destroy(&self);
}
