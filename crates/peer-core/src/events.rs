//! Event bus for the peer session core
//!
//! Everything the presentation layer needs to react to (identity arrival, channel
//! state changes, appended messages, call progress and media availability) is
//! published as a [`PeerEvent`] on a broadcast channel. Subscribers that fall behind
//! lose the oldest events; session state itself is always readable through getters.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace};

use crate::call::{CallDirection, CallEndReason, CallState};
use crate::chat::{ChannelState, ConnectionDirection, Message};
use crate::identity::PeerIdentity;

/// Default number of buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Events emitted by the identity manager and the sessions
#[derive(Debug, Clone)]
pub enum PeerEvent {
    // Identity events
    /// The signaling service assigned the local identity
    IdentityAssigned {
        identity: PeerIdentity,
    },

    /// Registration failed or timed out
    RegistrationFailed {
        reason: String,
    },

    /// The transport handle was released; dependent sessions wind down
    IdentityReleased {
        identity: Option<PeerIdentity>,
    },

    // Chat events
    /// A chat connection changed state
    ConnectionStateChanged {
        remote: PeerIdentity,
        direction: ConnectionDirection,
        /// `None` when the connection was just created
        previous: Option<ChannelState>,
        new_state: ChannelState,
    },

    /// Establishing or keeping a chat connection failed
    ConnectionFailed {
        remote: PeerIdentity,
        reason: String,
    },

    /// A message was appended to the chat log
    MessageAppended {
        message: Message,
    },

    // Call events
    /// The call state machine moved
    CallStateChanged {
        remote: Option<PeerIdentity>,
        direction: Option<CallDirection>,
        previous: CallState,
        new_state: CallState,
    },

    /// Local camera/microphone stream acquired for a call
    LocalStreamReady {
        remote: PeerIdentity,
        stream_id: String,
    },

    /// The remote media stream arrived
    RemoteStreamReady {
        remote: PeerIdentity,
        stream_id: String,
    },

    /// Camera/microphone could not be acquired
    MediaAccessFailed {
        remote: PeerIdentity,
        reason: String,
    },

    /// A call returned to idle
    CallEnded {
        remote: PeerIdentity,
        reason: CallEndReason,
    },

    /// An asynchronous failure with no more specific event
    Error {
        message: String,
        category: ErrorCategory,
    },
}

impl PeerEvent {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            PeerEvent::IdentityAssigned { .. } => "identity_assigned",
            PeerEvent::RegistrationFailed { .. } => "registration_failed",
            PeerEvent::IdentityReleased { .. } => "identity_released",
            PeerEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            PeerEvent::ConnectionFailed { .. } => "connection_failed",
            PeerEvent::MessageAppended { .. } => "message_appended",
            PeerEvent::CallStateChanged { .. } => "call_state_changed",
            PeerEvent::LocalStreamReady { .. } => "local_stream_ready",
            PeerEvent::RemoteStreamReady { .. } => "remote_stream_ready",
            PeerEvent::MediaAccessFailed { .. } => "media_access_failed",
            PeerEvent::CallEnded { .. } => "call_ended",
            PeerEvent::Error { .. } => "error",
        }
    }
}

/// Error categories for event classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Signaling or transport failure
    Transport,
    /// Camera/microphone failure
    Media,
    /// Malformed payload or unexpected event
    Protocol,
}

/// Raw subscription; yields `Err` for every lagged gap
pub type EventStream = BroadcastStream<PeerEvent>;

/// Subscription that only yields events, for callers without `StreamExt` in scope
pub struct EventIterator {
    stream: EventStream,
    skipped: u64,
}

impl EventIterator {
    pub fn new(stream: EventStream) -> Self {
        Self { stream, skipped: 0 }
    }

    /// Next event, stepping over anything lost while this subscriber lagged
    pub async fn next(&mut self) -> Option<PeerEvent> {
        use tokio_stream::StreamExt;
        use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

        while let Some(item) = self.stream.next().await {
            match item {
                Ok(event) => return Some(event),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    self.skipped += missed;
                    debug!("Event subscriber lagged, {} events skipped", missed);
                }
            }
        }
        None
    }

    /// Events lost to lag since this iterator was created
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

/// Sending half of the event bus, shared by the identity manager and every session
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<PeerEvent>,
}

impl EventEmitter {
    /// Bus buffering up to `capacity` events per subscriber (at least one)
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish `event`; returns how many subscribers it reached
    pub fn emit(&self, event: PeerEvent) -> usize {
        trace!("Publishing {}", event.name());
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Subscribe through an [`EventIterator`]
    pub fn subscribe_simple(&self) -> EventIterator {
        EventIterator::new(self.subscribe())
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
