//! Text chat over a reliable ordered data channel
//!
//! # Usage
//!
//! ```rust
//! use peerlink_core::chat::{ChannelState, ChatSession, Sender};
//! use peerlink_core::config::PeerConfig;
//! use peerlink_core::identity::IdentityManager;
//! use peerlink_core::transport::LoopbackNetwork;
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
//! let mut alice_chat = ChatSession::new(alice.handle(), config.chat.clone());
//! let mut bob_chat = ChatSession::new(bob.handle(), config.chat.clone());
//!
//! alice_chat.connect("bob").await?;
//! assert_eq!(bob_chat.process_next().await, Some(ChannelState::Open));
//! assert_eq!(alice_chat.process_next().await, Some(ChannelState::Open));
//!
//! alice_chat.send("hi");
//! bob_chat.process_next().await;
//! assert_eq!(bob_chat.messages()[0].text, "hi");
//! assert_eq!(bob_chat.messages()[0].sender, Sender::Peer);
//! # Ok(())
//! # }
//! ```

mod message;
mod session;

pub use message::{Message, MessageLog, Sender};
pub use session::{ChannelState, ChatInput, ChatSession, Connection, ConnectionDirection};
