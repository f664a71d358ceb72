//! Chat session state machine
//!
//! A [`ChatSession`] owns at most one [`Connection`] at a time. Outbound
//! connections start `Pending` and open when the transport reports the channel
//! ready; inbound connections are accepted straight into `Open`.
//!
//! ```text
//!   connect() ──▶ Pending ──Open──▶ Open ──Closed/Error/close()──▶ Closed
//!                    │                                               ▲
//!                    └──────── Error / Closed / timeout ─────────────┘
//! ```
//!
//! Inputs are applied one at a time through [`ChatSession::handle_event`]; the
//! [`ChatSession::process_next`] driver waits for whichever input arrives first.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::message::{Message, MessageLog, Sender};
use crate::config::{ChatConfig, InboundPolicy};
use crate::driver;
use crate::error::{PeerError, PeerResult};
use crate::events::{ErrorCategory, PeerEvent};
use crate::identity::{IdentityStatus, PeerIdentity, SessionHandle};
use crate::transport::{ChannelEvent, ChannelHandle, DataChannel, IncomingConnection, TransportError};

/// Lifecycle of a chat connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// Requested, waiting for the channel to open
    Pending,
    /// Messages can flow
    Open,
    /// Finished; a new connection may be made
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Pending => write!(f, "pending"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Closed => write!(f, "closed"),
        }
    }
}

/// Who started a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionDirection {
    /// This endpoint called `connect`
    Initiated,
    /// The remote endpoint connected to us
    Accepted,
}

/// The single channel a chat session talks over
pub struct Connection {
    remote: PeerIdentity,
    state: ChannelState,
    direction: ConnectionDirection,
    created_at: DateTime<Utc>,
    channel: Option<Arc<dyn DataChannel>>,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    deadline: Option<Instant>,
    /// Payloads that arrived before the channel reported open
    held: Vec<Bytes>,
}

impl Connection {
    pub fn remote(&self) -> &PeerIdentity {
        &self.remote
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("direction", &self.direction)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Inputs that drive a chat session
#[derive(Debug)]
pub enum ChatInput {
    /// A remote peer opened a channel to us
    Incoming(IncomingConnection),
    /// An event on the current connection's channel
    Channel(ChannelEvent),
    /// The pending connection did not open in time
    ConnectTimeout,
    /// The identity manager released the transport
    IdentityReleased,
}

/// Text chat with one remote peer
pub struct ChatSession {
    handle: SessionHandle,
    config: ChatConfig,
    identity: watch::Receiver<IdentityStatus>,
    incoming: Option<mpsc::UnboundedReceiver<IncomingConnection>>,
    connection: Option<Connection>,
    log: MessageLog,
    released: bool,
}

impl ChatSession {
    /// Create a session and start listening for inbound connections
    pub fn new(handle: SessionHandle, config: ChatConfig) -> Self {
        let incoming = handle.transport().incoming_connections();
        let identity = handle.watch();
        Self {
            handle,
            config,
            identity,
            incoming: Some(incoming),
            connection: None,
            log: MessageLog::new(),
            released: false,
        }
    }

    /// State of the current connection; `Closed` when there is none
    pub fn state(&self) -> ChannelState {
        self.connection
            .as_ref()
            .map(|c| c.state)
            .unwrap_or(ChannelState::Closed)
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn remote(&self) -> Option<&PeerIdentity> {
        self.connection.as_ref().map(|c| &c.remote)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// True once the transport has been released; the session is inert after that
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Open a connection to `remote`
    ///
    /// Returns once the transport accepted the request; the connection is `Pending`
    /// until the channel reports open. A pending connection is superseded by a new
    /// attempt; an open one must be closed first.
    pub async fn connect(&mut self, remote: &str) -> PeerResult<()> {
        let remote = PeerIdentity::parse(remote)?;
        self.observe_release();
        let local = self.handle.require_identity()?;

        if remote == local {
            return Err(PeerError::invalid_target(
                remote.as_str(),
                "cannot connect to the local identity",
            ));
        }
        if self.is_open() {
            return Err(PeerError::invalid_state(format!(
                "a chat connection to {} is already open",
                self.remote().map(|r| r.as_str()).unwrap_or_default()
            )));
        }
        if self.state() == ChannelState::Pending {
            debug!("Superseding pending connection");
            self.close_connection();
        }

        info!(remote = %remote, "Connecting chat channel");
        self.connection = Some(Connection {
            remote: remote.clone(),
            state: ChannelState::Pending,
            direction: ConnectionDirection::Initiated,
            created_at: Utc::now(),
            channel: None,
            events: None,
            deadline: None,
            held: Vec::new(),
        });
        self.emit_state(None, ChannelState::Pending);

        match self.handle.transport().connect(&remote).await {
            Ok(ChannelHandle { channel, events }) => {
                if let Some(conn) = self.connection.as_mut() {
                    conn.channel = Some(channel);
                    conn.events = Some(events);
                    conn.deadline = Instant::now().checked_add(self.config.connect_timeout());
                }
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                self.fail_connection(&reason);
                Err(match err {
                    TransportError::Destroyed | TransportError::NotRegistered => err.into(),
                    _ => PeerError::connection(remote.as_str(), reason),
                })
            }
        }
    }

    /// Send a text message over the open connection
    ///
    /// Whitespace-only text and sends without an open connection are ignored.
    /// Returns whether a message was appended to the log.
    pub fn send(&mut self, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        self.observe_release();

        let channel = match self.connection.as_ref() {
            Some(conn) if conn.state == ChannelState::Open => conn.channel.clone(),
            _ => {
                debug!("Dropping message: no open chat connection");
                return false;
            }
        };

        let message = self.log.append(text, Sender::Local).clone();
        self.handle
            .events()
            .emit(PeerEvent::MessageAppended { message });

        let sent = match channel {
            Some(channel) => channel.send(Bytes::copy_from_slice(text.as_bytes())),
            None => Err(TransportError::ChannelClosed),
        };
        if let Err(e) = sent {
            warn!("Failed to transmit chat message: {}", e);
            self.handle.events().emit(PeerEvent::Error {
                message: format!("failed to transmit chat message: {}", e),
                category: ErrorCategory::Transport,
            });
        }
        true
    }

    /// Close the current connection; no effect without one
    pub fn close(&mut self) {
        if self.state() != ChannelState::Closed {
            info!("Closing chat connection");
            self.close_connection();
        }
    }

    /// Apply one input and return the resulting connection state
    pub fn handle_event(&mut self, input: ChatInput) -> ChannelState {
        match input {
            ChatInput::Incoming(incoming) => self.accept(incoming),
            ChatInput::Channel(event) => self.apply_channel_event(event),
            ChatInput::ConnectTimeout => {
                if self.state() == ChannelState::Pending {
                    warn!("Chat connection did not open in time");
                    self.fail_connection("connect timed out");
                }
            }
            ChatInput::IdentityReleased => {
                if !self.released {
                    info!("Identity released; closing chat session");
                    self.released = true;
                    self.incoming = None;
                    self.close_connection();
                }
            }
        }
        self.state()
    }

    /// Wait for the next input and apply it
    ///
    /// Returns `None` once the identity has been released and nothing more can
    /// happen.
    pub async fn process_next(&mut self) -> Option<ChannelState> {
        enum Wake {
            Input(ChatInput),
            IncomingClosed,
        }

        loop {
            if self.released {
                return None;
            }

            let deadline = self.connection.as_ref().and_then(|c| c.deadline);
            let wake = {
                let channel = self.connection.as_mut().and_then(|c| c.events.as_mut());
                tokio::select! {
                    biased;
                    _ = driver::identity_released(&mut self.identity) => {
                        Wake::Input(ChatInput::IdentityReleased)
                    }
                    event = driver::recv_or_pending(channel) => {
                        Wake::Input(ChatInput::Channel(event.unwrap_or(ChannelEvent::Closed)))
                    }
                    incoming = driver::recv_or_pending(self.incoming.as_mut()) => match incoming {
                        Some(incoming) => Wake::Input(ChatInput::Incoming(incoming)),
                        None => Wake::IncomingClosed,
                    },
                    _ = driver::sleep_until_or_pending(deadline) => Wake::Input(ChatInput::ConnectTimeout),
                }
            };

            match wake {
                Wake::Input(input) => return Some(self.handle_event(input)),
                Wake::IncomingClosed => {
                    debug!("Transport stopped delivering inbound connections");
                    self.incoming = None;
                }
            }
        }
    }

    fn accept(&mut self, incoming: IncomingConnection) {
        let remote = incoming.remote().clone();
        if self.released {
            incoming.channel.close();
            return;
        }
        if self.is_open() && self.config.inbound_policy == InboundPolicy::RejectWhileOpen {
            info!(remote = %remote, "Rejecting inbound chat connection: one is already open");
            incoming.channel.close();
            return;
        }
        if self.state() != ChannelState::Closed {
            info!(remote = %remote, "Inbound chat connection replaces the current one");
            self.close_connection();
        }

        info!(remote = %remote, "Accepted inbound chat connection");
        let IncomingConnection { channel, events } = incoming;
        self.connection = Some(Connection {
            remote,
            state: ChannelState::Open,
            direction: ConnectionDirection::Accepted,
            created_at: Utc::now(),
            channel: Some(channel),
            events: Some(events),
            deadline: None,
            held: Vec::new(),
        });
        self.emit_state(None, ChannelState::Open);
    }

    fn apply_channel_event(&mut self, event: ChannelEvent) {
        let state = self.state();
        if state == ChannelState::Closed {
            debug!("Ignoring channel event on closed connection: {:?}", event);
            return;
        }

        match event {
            ChannelEvent::Open => {
                if state == ChannelState::Pending {
                    self.set_state(ChannelState::Open);
                    let held = match self.connection.as_mut() {
                        Some(conn) => {
                            conn.deadline = None;
                            info!(remote = %conn.remote, "Chat connection open");
                            std::mem::take(&mut conn.held)
                        }
                        None => Vec::new(),
                    };
                    for payload in held {
                        self.receive(&payload);
                    }
                }
            }
            ChannelEvent::Data(payload) => {
                if state == ChannelState::Pending {
                    debug!("Holding {} bytes until the channel opens", payload.len());
                    if let Some(conn) = self.connection.as_mut() {
                        conn.held.push(payload);
                    }
                    return;
                }
                self.receive(&payload);
            }
            ChannelEvent::Error(reason) => {
                error!(remote = ?self.remote(), "Chat channel error: {}", reason);
                self.fail_connection(&reason);
            }
            ChannelEvent::Closed => {
                if state == ChannelState::Pending {
                    self.fail_connection("channel closed before opening");
                } else {
                    info!("Chat connection closed by remote");
                    self.close_connection();
                }
            }
        }
    }

    fn receive(&mut self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload).into_owned();
        let message = self.log.append(text, Sender::Peer).clone();
        self.handle
            .events()
            .emit(PeerEvent::MessageAppended { message });
    }

    fn observe_release(&mut self) {
        if !self.released && self.handle.is_released() {
            self.handle_event(ChatInput::IdentityReleased);
        }
    }

    /// Report a failure on the current connection and close it
    fn fail_connection(&mut self, reason: &str) {
        if let Some(conn) = self.connection.as_ref() {
            self.handle.events().emit(PeerEvent::ConnectionFailed {
                remote: conn.remote.clone(),
                reason: reason.to_string(),
            });
        }
        self.close_connection();
    }

    /// Close the transport channel and move the connection to `Closed`
    fn close_connection(&mut self) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        if conn.state == ChannelState::Closed {
            return;
        }
        conn.events = None;
        conn.deadline = None;
        conn.held.clear();
        if let Some(channel) = conn.channel.take() {
            channel.close();
        }
        self.set_state(ChannelState::Closed);
    }

    fn set_state(&mut self, new_state: ChannelState) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        let previous = conn.state;
        if previous == new_state {
            return;
        }
        conn.state = new_state;
        debug!(remote = %conn.remote, "Chat connection {} -> {}", previous, new_state);
        self.emit_state(Some(previous), new_state);
    }

    fn emit_state(&self, previous: Option<ChannelState>, new_state: ChannelState) {
        if let Some(conn) = self.connection.as_ref() {
            self.handle.events().emit(PeerEvent::ConnectionStateChanged {
                remote: conn.remote.clone(),
                direction: conn.direction,
                previous,
                new_state,
            });
        }
    }
}

impl fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatSession")
            .field("connection", &self.connection)
            .field("messages", &self.log.len())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(channel) = self.connection.as_mut().and_then(|c| c.channel.take()) {
            channel.close();
        }
    }
}
