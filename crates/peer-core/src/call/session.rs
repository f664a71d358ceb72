//! Call session state machine
//!
//! ```text
//!            place_call()                 remote stream
//!   Idle ─────────────────▶ Dialing ───────────────────────▶ Active
//!    ▲  │  inbound call                                        │
//!    │  └─────────────────▶ Ringing ───────────────────────▶──┘
//!    │                         │   remote stream                 │
//!    └─────────────────────────┴─────────────────────────────────┘
//!       end_call / remote close / error / timeout / identity released
//! ```
//!
//! Every path back to `Idle` runs through one teardown routine: the transport call
//! is closed, local tracks are stopped and both stream references are cleared.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::CallConfig;
use crate::driver;
use crate::error::{PeerError, PeerResult};
use crate::events::PeerEvent;
use crate::identity::{IdentityStatus, PeerIdentity, SessionHandle};
use crate::media::{MediaDevices, MediaError, MediaStream};
use crate::transport::{CallEvent, CallHandle, CallLink, IncomingCall, TransportError};

/// Call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// No call
    Idle,
    /// Outbound call being set up
    Dialing,
    /// Inbound call being set up
    Ringing,
    /// Media flowing both ways
    Active,
}

impl CallState {
    /// Dialing or ringing
    pub fn is_setting_up(&self) -> bool {
        matches!(self, CallState::Dialing | CallState::Ringing)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Idle => write!(f, "idle"),
            CallState::Dialing => write!(f, "dialing"),
            CallState::Ringing => write!(f, "ringing"),
            CallState::Active => write!(f, "active"),
        }
    }
}

/// Who placed the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// Why a call returned to idle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEndReason {
    /// `end_call` was invoked
    LocalHangup,
    /// The remote endpoint closed the call
    RemoteHangup,
    /// Camera/microphone could not be acquired
    MediaUnavailable(String),
    /// The transport refused to place or answer the call
    TransportRefused(String),
    /// The transport reported an error on the call
    TransportError(String),
    /// Dialing or ringing took longer than the setup timeout
    SetupTimeout,
    /// The identity manager released the transport
    IdentityReleased,
}

impl fmt::Display for CallEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallEndReason::LocalHangup => write!(f, "local hangup"),
            CallEndReason::RemoteHangup => write!(f, "remote hangup"),
            CallEndReason::MediaUnavailable(reason) => write!(f, "media unavailable: {}", reason),
            CallEndReason::TransportRefused(reason) => write!(f, "transport refused: {}", reason),
            CallEndReason::TransportError(reason) => write!(f, "transport error: {}", reason),
            CallEndReason::SetupTimeout => write!(f, "setup timed out"),
            CallEndReason::IdentityReleased => write!(f, "identity released"),
        }
    }
}

/// Inputs that drive a call session
#[derive(Debug)]
pub enum CallInput {
    /// A remote peer placed a call to us
    Incoming(IncomingCall),
    /// An event on the current call
    Call(CallEvent),
    /// Dialing or ringing did not complete in time
    SetupTimeout,
    /// The identity manager released the transport
    IdentityReleased,
}

/// Audio/video call with one remote peer
pub struct CallSession {
    handle: SessionHandle,
    devices: Arc<dyn MediaDevices>,
    config: CallConfig,
    identity: watch::Receiver<IdentityStatus>,
    incoming: Option<mpsc::UnboundedReceiver<IncomingCall>>,
    state: CallState,
    remote: Option<PeerIdentity>,
    direction: Option<CallDirection>,
    link: Option<Arc<dyn CallLink>>,
    events: Option<mpsc::UnboundedReceiver<CallEvent>>,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
    deadline: Option<Instant>,
    connected_at: Option<DateTime<Utc>>,
    released: bool,
}

impl CallSession {
    /// Create a session and start listening for inbound calls
    pub fn new(handle: SessionHandle, devices: Arc<dyn MediaDevices>, config: CallConfig) -> Self {
        let incoming = handle.transport().incoming_calls();
        let identity = handle.watch();
        Self {
            handle,
            devices,
            config,
            identity,
            incoming: Some(incoming),
            state: CallState::Idle,
            remote: None,
            direction: None,
            link: None,
            events: None,
            local_stream: None,
            remote_stream: None,
            deadline: None,
            connected_at: None,
            released: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn remote(&self) -> Option<&PeerIdentity> {
        self.remote.as_ref()
    }

    pub fn direction(&self) -> Option<CallDirection> {
        self.direction
    }

    /// Local camera/microphone stream while a call holds one
    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    /// Remote stream while the call is active
    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    /// When the call became active
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Call `remote`
    ///
    /// Moves to `Dialing`, acquires local media and hands the stream to the
    /// transport. The call becomes `Active` when the remote stream arrives, which
    /// [`process_next`](Self::process_next) observes.
    pub async fn place_call(&mut self, remote: &str) -> PeerResult<()> {
        let remote = PeerIdentity::parse(remote)?;
        self.observe_release();
        let local = self.handle.require_identity()?;

        if remote == local {
            return Err(PeerError::invalid_target(remote.as_str(), "cannot call the local identity"));
        }
        if self.state != CallState::Idle {
            return Err(PeerError::invalid_state(format!(
                "cannot place a call while {}",
                self.state
            )));
        }

        info!(remote = %remote, "Placing call");
        self.remote = Some(remote.clone());
        self.direction = Some(CallDirection::Outbound);
        self.deadline = Instant::now().checked_add(self.config.setup_timeout());
        self.transition(CallState::Dialing);

        let stream = match self.devices.acquire(&self.config.constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                self.media_failed(&remote, &e);
                return Err(PeerError::MediaAccess(e));
            }
        };
        self.local_stream = Some(stream.clone());
        self.handle.events().emit(PeerEvent::LocalStreamReady {
            remote: remote.clone(),
            stream_id: stream.id().to_string(),
        });

        if self.handle.is_released() {
            self.handle_release();
            return Err(PeerError::registration("identity has been released"));
        }

        match self.handle.transport().call(&remote, stream).await {
            Ok(CallHandle { link, events }) => {
                debug!(remote = %remote, "Call request accepted by transport");
                self.link = Some(link);
                self.events = Some(events);
                Ok(())
            }
            Err(e) => {
                warn!(remote = %remote, "Transport refused call: {}", e);
                self.release(CallEndReason::TransportRefused(e.to_string()));
                Err(match e {
                    TransportError::Destroyed | TransportError::NotRegistered => e.into(),
                    _ => PeerError::connection(remote.as_str(), e.to_string()),
                })
            }
        }
    }

    /// Hang up; no effect while idle
    pub fn end_call(&mut self) {
        if self.state != CallState::Idle {
            info!("Ending call");
            self.release(CallEndReason::LocalHangup);
        }
    }

    /// Apply one input and return the resulting call state
    pub async fn handle_event(&mut self, input: CallInput) -> CallState {
        match input {
            CallInput::Incoming(call) => self.answer_incoming(call).await,
            CallInput::Call(event) => self.apply_call_event(event),
            CallInput::SetupTimeout => {
                if self.state.is_setting_up() {
                    warn!("Call setup timed out in {}", self.state);
                    self.release(CallEndReason::SetupTimeout);
                }
            }
            CallInput::IdentityReleased => self.handle_release(),
        }
        self.state
    }

    /// Wait for the next input and apply it
    ///
    /// Returns `None` once the identity has been released and nothing more can
    /// happen.
    pub async fn process_next(&mut self) -> Option<CallState> {
        enum Wake {
            Input(CallInput),
            IncomingClosed,
        }

        loop {
            if self.released {
                return None;
            }

            let deadline = if self.state.is_setting_up() { self.deadline } else { None };
            let wake = tokio::select! {
                biased;
                _ = driver::identity_released(&mut self.identity) => Wake::Input(CallInput::IdentityReleased),
                event = driver::recv_or_pending(self.events.as_mut()) => {
                    Wake::Input(CallInput::Call(event.unwrap_or(CallEvent::Closed)))
                }
                incoming = driver::recv_or_pending(self.incoming.as_mut()) => match incoming {
                    Some(call) => Wake::Input(CallInput::Incoming(call)),
                    None => Wake::IncomingClosed,
                },
                _ = driver::sleep_until_or_pending(deadline) => Wake::Input(CallInput::SetupTimeout),
            };

            match wake {
                Wake::Input(input) => return Some(self.handle_event(input).await),
                Wake::IncomingClosed => {
                    debug!("Transport stopped delivering inbound calls");
                    self.incoming = None;
                }
            }
        }
    }

    async fn answer_incoming(&mut self, call: IncomingCall) {
        let remote = call.remote().clone();
        if self.released || self.state != CallState::Idle {
            info!(remote = %remote, "Declining inbound call while {}", self.state);
            call.link.close();
            return;
        }

        info!(remote = %remote, "Inbound call");
        let CallHandle { link, events } = call;
        self.remote = Some(remote.clone());
        self.direction = Some(CallDirection::Inbound);
        self.link = Some(link.clone());
        self.events = Some(events);
        self.deadline = Instant::now().checked_add(self.config.setup_timeout());
        self.transition(CallState::Ringing);

        let stream = match self.devices.acquire(&self.config.constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                // Not answered; the caller sees the call dropped
                self.media_failed(&remote, &e);
                return;
            }
        };
        self.local_stream = Some(stream.clone());
        self.handle.events().emit(PeerEvent::LocalStreamReady {
            remote: remote.clone(),
            stream_id: stream.id().to_string(),
        });

        if self.handle.is_released() {
            self.handle_release();
            return;
        }

        if let Err(e) = link.answer(stream) {
            warn!(remote = %remote, "Failed to answer call: {}", e);
            self.release(CallEndReason::TransportRefused(e.to_string()));
        } else {
            debug!(remote = %remote, "Answered inbound call");
        }
    }

    fn apply_call_event(&mut self, event: CallEvent) {
        if self.state == CallState::Idle {
            debug!("Ignoring call event while idle: {:?}", event);
            return;
        }

        match event {
            CallEvent::Stream(stream) => {
                if !self.state.is_setting_up() {
                    debug!("Ignoring additional remote stream {}", stream.id());
                    return;
                }
                let remote = self.remote.clone().unwrap_or_else(|| PeerIdentity::new(""));
                self.handle.events().emit(PeerEvent::RemoteStreamReady {
                    remote: remote.clone(),
                    stream_id: stream.id().to_string(),
                });
                self.remote_stream = Some(stream);
                self.deadline = None;
                self.connected_at = Some(Utc::now());
                self.transition(CallState::Active);
                info!(remote = %remote, "Call active");
            }
            CallEvent::Error(reason) => {
                error!(remote = ?self.remote, "Call transport error: {}", reason);
                self.release(CallEndReason::TransportError(reason));
            }
            CallEvent::Closed => {
                info!("Call closed by remote");
                self.release(CallEndReason::RemoteHangup);
            }
        }
    }

    fn media_failed(&mut self, remote: &PeerIdentity, error: &MediaError) {
        warn!(remote = %remote, "Media acquisition failed: {}", error);
        self.handle.events().emit(PeerEvent::MediaAccessFailed {
            remote: remote.clone(),
            reason: error.to_string(),
        });
        self.release(CallEndReason::MediaUnavailable(error.to_string()));
    }

    fn observe_release(&mut self) {
        if !self.released && self.handle.is_released() {
            self.handle_release();
        }
    }

    fn handle_release(&mut self) {
        if self.released {
            return;
        }
        info!("Identity released; shutting down call session");
        self.released = true;
        self.incoming = None;
        self.release(CallEndReason::IdentityReleased);
    }

    /// Return to idle, closing the call and stopping local media
    fn release(&mut self, reason: CallEndReason) {
        let link = self.link.take();
        self.events = None;
        self.deadline = None;
        self.connected_at = None;
        if let Some(link) = link {
            link.close();
        }
        if let Some(stream) = self.local_stream.take() {
            let stopped = stream.stop_all_tracks();
            debug!("Stopped {} local tracks", stopped);
        }
        self.remote_stream = None;

        if self.state == CallState::Idle {
            return;
        }
        self.transition(CallState::Idle);

        self.direction = None;
        if let Some(remote) = self.remote.take() {
            info!(remote = %remote, "Call ended: {}", reason);
            self.handle
                .events()
                .emit(PeerEvent::CallEnded { remote, reason });
        }
    }

    fn transition(&mut self, new_state: CallState) {
        let previous = self.state;
        if previous == new_state {
            return;
        }
        self.state = new_state;
        debug!("Call {} -> {}", previous, new_state);
        self.handle.events().emit(PeerEvent::CallStateChanged {
            remote: self.remote.clone(),
            direction: self.direction,
            previous,
            new_state,
        });
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("state", &self.state)
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        if let Some(stream) = self.local_stream.take() {
            stream.stop_all_tracks();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::identity::IdentityManager;
    use crate::media::{MockBehavior, MockMediaDevices};
    use crate::transport::{LoopbackNetwork, PeerTransport};
    use std::time::Duration;

    async fn registered(network: &LoopbackNetwork, name: &str) -> IdentityManager {
        let mut manager = IdentityManager::new(network.endpoint_with_identity(name), &PeerConfig::default());
        manager.initialize().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_place_call_from_non_idle_is_rejected() {
        let network = LoopbackNetwork::new();
        let alice = registered(&network, "alice").await;
        let bob = registered(&network, "bob").await;
        let _bob_calls = bob.transport().incoming_calls();

        let devices = Arc::new(MockMediaDevices::new());
        let mut call = CallSession::new(alice.handle(), devices.clone(), CallConfig::default());
        call.place_call("bob").await.unwrap();
        assert_eq!(call.state(), CallState::Dialing);
        assert!(call.local_stream().is_some());

        let err = call.place_call("bob").await.unwrap_err();
        assert!(matches!(err, PeerError::InvalidState { .. }));
        assert_eq!(devices.attempts(), 1);
    }

    #[tokio::test]
    async fn test_transport_refusal_releases_media() {
        let network = LoopbackNetwork::new();
        let alice = registered(&network, "alice").await;
        let devices = Arc::new(MockMediaDevices::new());
        let mut call = CallSession::new(alice.handle(), devices.clone(), CallConfig::default());

        let err = call.place_call("nobody").await.unwrap_err();
        assert!(matches!(err, PeerError::Connection { .. }));
        assert_eq!(call.state(), CallState::Idle);
        assert!(call.local_stream().is_none());
        assert_eq!(devices.issued_tracks(), 2);
        assert_eq!(devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_end_call_twice_is_idempotent() {
        let network = LoopbackNetwork::new();
        let alice = registered(&network, "alice").await;
        let bob = registered(&network, "bob").await;
        let _bob_calls = bob.transport().incoming_calls();

        let devices = Arc::new(MockMediaDevices::new());
        let mut call = CallSession::new(alice.handle(), devices.clone(), CallConfig::default());
        let mut events = alice.emitter().subscribe_simple();

        call.place_call("bob").await.unwrap();
        call.end_call();
        call.end_call();

        assert_eq!(call.state(), CallState::Idle);
        assert!(call.remote().is_none());
        assert!(call.local_stream().is_none() && call.remote_stream().is_none());
        assert_eq!(devices.live_tracks(), 0);

        let mut ended = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(20), events.next()).await
        {
            if let PeerEvent::CallEnded { reason, .. } = event {
                assert_eq!(reason, CallEndReason::LocalHangup);
                ended += 1;
            }
        }
        assert_eq!(ended, 1);
    }

    #[tokio::test]
    async fn test_setup_timeout_returns_to_idle() {
        let network = LoopbackNetwork::new();
        let alice = registered(&network, "alice").await;
        let bob = registered(&network, "bob").await;
        let _bob_calls = bob.transport().incoming_calls();

        let devices = Arc::new(MockMediaDevices::new());
        let config = CallConfig {
            setup_timeout_ms: 20,
            ..CallConfig::default()
        };
        let mut call = CallSession::new(alice.handle(), devices.clone(), config);
        call.place_call("bob").await.unwrap();

        assert_eq!(call.process_next().await, Some(CallState::Idle));
        assert_eq!(devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_inbound_media_failure_drops_call() {
        let network = LoopbackNetwork::new();
        let alice = registered(&network, "alice").await;
        let bob = registered(&network, "bob").await;

        let bob_devices = Arc::new(MockMediaDevices::with_behavior(MockBehavior::NoDevice));
        let mut bob_call = CallSession::new(bob.handle(), bob_devices, CallConfig::default());
        let mut alice_call = CallSession::new(
            alice.handle(),
            Arc::new(MockMediaDevices::new()),
            CallConfig::default(),
        );

        alice_call.place_call("bob").await.unwrap();
        assert_eq!(bob_call.process_next().await, Some(CallState::Idle));
        assert!(bob_call.local_stream().is_none());

        // The caller sees the call dropped
        assert_eq!(alice_call.process_next().await, Some(CallState::Idle));
    }

    #[tokio::test]
    async fn test_answer_after_caller_hangup_releases_media() {
        let network = LoopbackNetwork::new();
        let alice = registered(&network, "alice").await;
        let bob = registered(&network, "bob").await;

        let bob_devices = Arc::new(MockMediaDevices::new());
        let mut bob_call = CallSession::new(bob.handle(), bob_devices.clone(), CallConfig::default());
        let mut alice_call = CallSession::new(
            alice.handle(),
            Arc::new(MockMediaDevices::new()),
            CallConfig::default(),
        );
        let mut events = bob.emitter().subscribe_simple();

        alice_call.place_call("bob").await.unwrap();
        alice_call.end_call();

        // Media is acquired, then the answer hits a closed call
        assert_eq!(bob_call.process_next().await, Some(CallState::Idle));
        assert_eq!(bob_devices.issued_tracks(), 2);
        assert_eq!(bob_devices.live_tracks(), 0);
        assert!(bob_call.local_stream().is_none());
        assert!(bob_call.remote_stream().is_none());
        assert!(bob_call.remote().is_none());

        let mut reasons = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(20), events.next()).await
        {
            if let PeerEvent::CallEnded { reason, .. } = event {
                reasons.push(reason);
            }
        }
        assert_eq!(reasons.len(), 1);
        assert!(matches!(reasons[0], CallEndReason::TransportRefused(_)));
    }
}
