//! Error types for the peer session core

use thiserror::Error;

use crate::media::MediaError;
use crate::transport::TransportError;

/// Result type for peer session operations
pub type PeerResult<T> = Result<T, PeerError>;

/// Errors surfaced by the identity manager and the chat/call sessions
#[derive(Debug, Error)]
pub enum PeerError {
    /// The signaling service never assigned an identity, or it has been released
    #[error("Registration error: {reason}")]
    Registration { reason: String },

    /// Empty or malformed remote identity; rejected before any transport call
    #[error("Invalid target identity {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    /// Transport-level connect/accept failure; the caller may retry
    #[error("Connection to {remote} failed: {reason}")]
    Connection { remote: String, reason: String },

    /// Camera/microphone could not be acquired
    #[error("Media access error: {0}")]
    MediaAccess(#[from] MediaError),

    /// Operation not permitted in the current session state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PeerError {
    /// Create a registration error
    pub fn registration(reason: impl Into<String>) -> Self {
        Self::Registration {
            reason: reason.into(),
        }
    }

    /// Create an invalid target error
    pub fn invalid_target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a connection error
    pub fn connection(remote: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connection {
            remote: remote.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the caller may retry the operation that produced this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::MediaAccess(_))
    }
}

impl From<TransportError> for PeerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unreachable { reason } => Self::registration(reason),
            TransportError::IdentityTaken { identity } => {
                Self::registration(format!("identity {} is already registered", identity))
            }
            TransportError::NotRegistered => Self::registration("transport is not registered"),
            TransportError::Destroyed => Self::registration("transport handle has been released"),
            TransportError::PeerUnavailable { peer } => {
                Self::connection(peer.clone(), format!("peer {} is unavailable", peer))
            }
            TransportError::ChannelClosed => Self::connection("", "channel closed"),
            TransportError::Rejected { reason } => Self::connection("", reason),
        }
    }
}
