//! Identity management
//!
//! The [`IdentityManager`] owns the transport handle for the lifetime of the
//! session. It registers with the signaling service once, publishes the assigned
//! [`PeerIdentity`] and, on teardown, destroys the transport so every dependent
//! chat connection and call winds down.
//!
//! # Lifecycle
//!
//! ```text
//!               initialize() ok
//!  Unassigned ─────────────────────▶ Assigned(id) ──┐
//!      │                                            │ teardown()
//!      │ initialize() error/timeout                 ▼
//!      └───────────────────────────▶ Failed ────▶ Released
//! ```
//!
//! Sessions never hold the manager itself. They receive a cloneable
//! [`SessionHandle`] carrying the transport, a watch on the identity status and the
//! event emitter; the watch is how they learn that the handle has been released.
//!
//! # Usage
//!
//! ```rust
//! use peerlink_core::config::PeerConfig;
//! use peerlink_core::identity::{IdentityManager, IdentityStatus};
//! use peerlink_core::transport::LoopbackNetwork;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let network = LoopbackNetwork::new();
//! let mut manager = IdentityManager::new(network.endpoint_with_identity("abc123"), &PeerConfig::default());
//!
//! let identity = manager.initialize().await.unwrap();
//! assert_eq!(identity.as_str(), "abc123");
//! assert_eq!(manager.current_identity(), IdentityStatus::Assigned(identity));
//!
//! manager.teardown();
//! assert_eq!(manager.current_identity(), IdentityStatus::Released);
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::error::{PeerError, PeerResult};
use crate::events::{EventEmitter, EventStream, PeerEvent};
use crate::transport::PeerTransport;

/// Identity assigned to an endpoint by the signaling service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Wrap an identity string as-is
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Parse user input: surrounding whitespace is trimmed and empty input rejected
    pub fn parse(raw: &str) -> PeerResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PeerError::invalid_target(raw, "identity is empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PeerIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Where the local identity stands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityStatus {
    /// Registration has not completed yet
    Unassigned,
    /// The signaling service assigned this identity
    Assigned(PeerIdentity),
    /// Registration failed; the reason stays observable
    Failed(String),
    /// The transport handle has been released
    Released,
}

impl IdentityStatus {
    pub fn identity(&self) -> Option<&PeerIdentity> {
        match self {
            IdentityStatus::Assigned(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self, IdentityStatus::Assigned(_))
    }

    pub fn is_released(&self) -> bool {
        matches!(self, IdentityStatus::Released)
    }
}

impl fmt::Display for IdentityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityStatus::Unassigned => write!(f, "unassigned"),
            IdentityStatus::Assigned(identity) => write!(f, "assigned({})", identity),
            IdentityStatus::Failed(reason) => write!(f, "failed: {}", reason),
            IdentityStatus::Released => write!(f, "released"),
        }
    }
}

/// What a chat or call session needs from the identity manager
#[derive(Debug, Clone)]
pub struct SessionHandle {
    transport: Arc<dyn PeerTransport>,
    status: watch::Receiver<IdentityStatus>,
    events: EventEmitter,
}

impl SessionHandle {
    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn status(&self) -> IdentityStatus {
        self.status.borrow().clone()
    }

    pub fn identity(&self) -> Option<PeerIdentity> {
        self.status.borrow().identity().cloned()
    }

    /// True once the manager released the transport (or went away)
    pub fn is_released(&self) -> bool {
        self.status.borrow().is_released() || self.status.has_changed().is_err()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// A fresh receiver on the identity status
    pub(crate) fn watch(&self) -> watch::Receiver<IdentityStatus> {
        self.status.clone()
    }

    /// The assigned identity, or a registration error explaining why there is none
    pub fn require_identity(&self) -> PeerResult<PeerIdentity> {
        if self.is_released() {
            return Err(PeerError::registration("identity has been released"));
        }
        match self.status() {
            IdentityStatus::Assigned(identity) => Ok(identity),
            IdentityStatus::Failed(reason) => Err(PeerError::registration(reason)),
            IdentityStatus::Unassigned => Err(PeerError::registration("identity not yet assigned")),
            IdentityStatus::Released => Err(PeerError::registration("identity has been released")),
        }
    }
}

/// Owner of the transport handle and the local identity
pub struct IdentityManager {
    transport: Arc<dyn PeerTransport>,
    config: PeerConfig,
    status: watch::Sender<IdentityStatus>,
    events: EventEmitter,
}

impl IdentityManager {
    /// Create a manager; nothing is contacted until [`initialize`](Self::initialize)
    pub fn new(transport: Arc<dyn PeerTransport>, config: &PeerConfig) -> Self {
        let (status, _) = watch::channel(IdentityStatus::Unassigned);
        Self {
            transport,
            config: config.clone(),
            status,
            events: EventEmitter::new(config.event_capacity),
        }
    }

    /// Register with the signaling service and return the assigned identity
    ///
    /// One-time: after success the same identity is returned without contacting the
    /// service again, after failure the recorded error is returned.
    pub async fn initialize(&mut self) -> PeerResult<PeerIdentity> {
        match self.current_identity() {
            IdentityStatus::Assigned(identity) => return Ok(identity),
            IdentityStatus::Failed(reason) => return Err(PeerError::registration(reason)),
            IdentityStatus::Released => {
                return Err(PeerError::registration("transport handle has been released"));
            }
            IdentityStatus::Unassigned => {}
        }

        let timeout = self.config.registration_timeout();
        debug!("Registering with signaling service (timeout {:?})", timeout);

        let outcome = match tokio::time::timeout(timeout, self.transport.register()).await {
            Ok(Ok(identity)) => Ok(identity),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("registration timed out after {:?}", timeout)),
        };

        match outcome {
            Ok(identity) => {
                info!(identity = %identity, "Identity assigned");
                self.status.send_replace(IdentityStatus::Assigned(identity.clone()));
                self.events.emit(PeerEvent::IdentityAssigned {
                    identity: identity.clone(),
                });
                Ok(identity)
            }
            Err(reason) => {
                warn!("Registration failed: {}", reason);
                self.status.send_replace(IdentityStatus::Failed(reason.clone()));
                self.events.emit(PeerEvent::RegistrationFailed {
                    reason: reason.clone(),
                });
                Err(PeerError::registration(reason))
            }
        }
    }

    /// Current identity status (`Unassigned` before registration completes)
    pub fn current_identity(&self) -> IdentityStatus {
        self.status.borrow().clone()
    }

    /// Handle to inject into chat and call sessions
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            transport: self.transport.clone(),
            status: self.status.subscribe(),
            events: self.events.clone(),
        }
    }

    /// Subscribe to the event bus
    pub fn events(&self) -> EventStream {
        self.events.subscribe()
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.events
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn is_released(&self) -> bool {
        self.status.borrow().is_released()
    }

    /// Release the transport handle; dependent sessions observe the release and
    /// wind down. Calling it again has no effect.
    pub fn teardown(&mut self) {
        if self.is_released() {
            return;
        }

        let identity = self.status.borrow().identity().cloned();
        self.transport.destroy();
        self.status.send_replace(IdentityStatus::Released);
        self.events.emit(PeerEvent::IdentityReleased {
            identity: identity.clone(),
        });

        match identity {
            Some(identity) => info!(identity = %identity, "Identity released"),
            None => info!("Transport released before an identity was assigned"),
        }
    }
}

impl fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityManager")
            .field("status", &*self.status.borrow())
            .field("transport", &self.transport)
            .finish()
    }
}

impl Drop for IdentityManager {
    fn drop(&mut self) {
        self.teardown();
    }
}
