//! Audio/video calls
//!
//! A [`CallSession`] acquires camera and microphone only when a call is placed or
//! answered, and releases them on every path back to [`CallState::Idle`].
//!
//! # Usage
//!
//! ```rust
//! use peerlink_core::call::{CallSession, CallState};
//! use peerlink_core::config::PeerConfig;
//! use peerlink_core::identity::IdentityManager;
//! use peerlink_core::media::MockMediaDevices;
//! use peerlink_core::transport::LoopbackNetwork;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> peerlink_core::PeerResult<()> {
//! let network = LoopbackNetwork::new();
//! let config = PeerConfig::default();
//!
//! let mut alice = IdentityManager::new(network.endpoint_with_identity("alice"), &config);
//! let mut bob = IdentityManager::new(network.endpoint_with_identity("bob"), &config);
//! alice.initialize().await?;
//! bob.initialize().await?;
//!
//! let devices = Arc::new(MockMediaDevices::new());
//! let mut caller = CallSession::new(alice.handle(), devices.clone(), config.call.clone());
//! let mut callee = CallSession::new(bob.handle(), devices.clone(), config.call.clone());
//!
//! caller.place_call("bob").await?;
//! assert_eq!(callee.process_next().await, Some(CallState::Ringing)); // answered
//! assert_eq!(callee.process_next().await, Some(CallState::Active));
//! assert_eq!(caller.process_next().await, Some(CallState::Active));
//!
//! caller.end_call();
//! assert_eq!(callee.process_next().await, Some(CallState::Idle));
//! assert_eq!(devices.live_tracks(), 0);
//! # Ok(())
//! # }
//! ```

mod session;

pub use session::{CallDirection, CallEndReason, CallInput, CallSession, CallState};
