//! # peerlink-core
//!
//! Peer session core for direct one-to-one chat and audio/video calls.
//!
//! The crate manages the connection lifecycle between two endpoints that know each
//! other only by an identity handed out by a signaling service: acquiring the local
//! identity, opening or accepting a channel or call, framing text messages,
//! acquiring and releasing camera/microphone, and tearing everything down on error
//! or explicit close. Signaling and NAT traversal stay behind the
//! [`transport::PeerTransport`] trait; device access stays behind
//! [`media::MediaDevices`].
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Presentation layer                        │
//! │      identity · connection/call state · log · streams         │
//! └───────────────▲───────────────────────────────┬───────────────┘
//!                 │ PeerEvent (broadcast)         │ connect / send / place_call / end_call
//! ┌───────────────┴───────────────────────────────▼───────────────┐
//! │  IdentityManager ──SessionHandle──▶ ChatSession   CallSession  │
//! └───────────────┬───────────────────────────────┬───────────────┘
//!                 │ PeerTransport                 │ MediaDevices
//! ┌───────────────▼───────────────┐   ┌───────────▼───────────────┐
//! │ signaling + data/media paths  │   │  camera / microphone      │
//! └───────────────────────────────┘   └───────────────────────────┘
//! ```
//!
//! The sessions are plain `&mut self` state machines. Each exposes a synchronous
//! or async `handle_event` that applies one input, and a `process_next` driver that
//! waits for the next input (inbound request, channel/call event, timeout or
//! identity release). Events for one channel or call are applied in the order the
//! transport delivered them.
//!
//! ## Quick start
//!
//! ```rust
//! use peerlink_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> PeerResult<()> {
//! let network = LoopbackNetwork::new();
//! let config = PeerConfig::default();
//!
//! let mut manager = IdentityManager::new(network.endpoint(), &config);
//! let identity = manager.initialize().await?;
//! println!("share this identity: {}", identity);
//!
//! let mut chat = ChatSession::new(manager.handle(), config.chat.clone());
//! assert_eq!(chat.state(), ChannelState::Closed);
//! assert!(!chat.send("nobody is listening"));
//!
//! manager.teardown();
//! assert_eq!(chat.process_next().await, Some(ChannelState::Closed));
//! assert!(chat.is_released());
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod media;
pub mod transport;

mod driver;

pub use call::{CallDirection, CallEndReason, CallSession, CallState};
pub use chat::{ChannelState, ChatSession, ConnectionDirection, Message, Sender};
pub use config::{CallConfig, ChatConfig, InboundPolicy, PeerConfig, PeerConfigBuilder};
pub use error::{PeerError, PeerResult};
pub use events::{EventEmitter, EventStream, PeerEvent};
pub use identity::{IdentityManager, IdentityStatus, PeerIdentity, SessionHandle};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used types
pub mod prelude {
    pub use crate::call::{CallEndReason, CallSession, CallState};
    pub use crate::chat::{ChannelState, ChatSession, Message, Sender};
    pub use crate::config::{InboundPolicy, PeerConfig};
    pub use crate::error::{PeerError, PeerResult};
    pub use crate::events::{EventIterator, PeerEvent};
    pub use crate::identity::{IdentityManager, IdentityStatus, PeerIdentity};
    pub use crate::media::{MediaConstraints, MediaDevices, MockMediaDevices};
    pub use crate::transport::{LoopbackNetwork, PeerTransport};
}
