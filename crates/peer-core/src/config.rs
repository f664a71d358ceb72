//! Configuration for the identity manager and the sessions
//!
//! All timeouts are stored as milliseconds so the structures serialize cleanly to
//! JSON; [`Duration`] accessors are provided for the code that uses them.
//!
//! ```rust
//! use peerlink_core::config::{InboundPolicy, PeerConfig};
//! use std::time::Duration;
//!
//! let config = PeerConfig::builder()
//!     .registration_timeout(Duration::from_secs(5))
//!     .chat(|chat| chat.inbound_policy(InboundPolicy::RejectWhileOpen))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.registration_timeout(), Duration::from_secs(5));
//! assert_eq!(config.chat.inbound_policy, InboundPolicy::RejectWhileOpen);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{PeerError, PeerResult};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::media::MediaConstraints;

/// What the chat session does with an inbound connection while one is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundPolicy {
    /// Accept the newcomer and close the existing connection (last writer wins)
    #[default]
    Replace,
    /// Close the newcomer and keep the existing connection
    RejectWhileOpen,
}

/// Chat session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// How long an outbound connection may stay pending before it is closed
    pub connect_timeout_ms: u64,
    pub inbound_policy: InboundPolicy,
}

impl ChatConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            inbound_policy: InboundPolicy::Replace,
        }
    }
}

/// Call session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// How long a call may stay in dialing/ringing before it is torn down
    pub setup_timeout_ms: u64,
    /// Devices requested for every call
    pub constraints: MediaConstraints,
}

impl CallConfig {
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            setup_timeout_ms: 30_000,
            constraints: MediaConstraints::audio_video(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// How long identity registration may take
    pub registration_timeout_ms: u64,
    /// Buffered events per event bus subscriber
    pub event_capacity: usize,
    pub chat: ChatConfig,
    pub call: CallConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            registration_timeout_ms: 10_000,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            chat: ChatConfig::default(),
            call: CallConfig::default(),
        }
    }
}

impl PeerConfig {
    pub fn builder() -> PeerConfigBuilder {
        PeerConfigBuilder::new()
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    /// Check that every setting is usable
    pub fn validate(&self) -> PeerResult<()> {
        if self.registration_timeout_ms == 0 {
            return Err(PeerError::config("registration timeout must be non-zero"));
        }
        if self.event_capacity == 0 {
            return Err(PeerError::config("event capacity must be non-zero"));
        }
        if self.chat.connect_timeout_ms == 0 {
            return Err(PeerError::config("chat connect timeout must be non-zero"));
        }
        if self.call.setup_timeout_ms == 0 {
            return Err(PeerError::config("call setup timeout must be non-zero"));
        }
        if self.call.constraints.is_empty() {
            return Err(PeerError::config(
                "call constraints must request audio, video or both",
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> PeerResult<Self> {
        let config: PeerConfig = serde_json::from_str(json)
            .map_err(|e| PeerError::config(format!("invalid configuration JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> PeerResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            PeerError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json_string(&self) -> PeerResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PeerError::config(format!("cannot serialize configuration: {}", e)))
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// Builder for [`PeerConfig`]
#[derive(Debug, Clone, Default)]
pub struct PeerConfigBuilder {
    config: PeerConfig,
}

impl PeerConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registration_timeout(mut self, timeout: Duration) -> Self {
        self.config.registration_timeout_ms = millis(timeout);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Configure chat settings
    pub fn chat(mut self, f: impl FnOnce(ChatConfigBuilder) -> ChatConfigBuilder) -> Self {
        self.config.chat = f(ChatConfigBuilder {
            config: self.config.chat,
        })
        .config;
        self
    }

    /// Configure call settings
    pub fn call(mut self, f: impl FnOnce(CallConfigBuilder) -> CallConfigBuilder) -> Self {
        self.config.call = f(CallConfigBuilder {
            config: self.config.call,
        })
        .config;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> PeerResult<PeerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Builder for chat settings
#[derive(Debug, Clone)]
pub struct ChatConfigBuilder {
    config: ChatConfig,
}

impl ChatConfigBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = millis(timeout);
        self
    }

    pub fn inbound_policy(mut self, policy: InboundPolicy) -> Self {
        self.config.inbound_policy = policy;
        self
    }
}

/// Builder for call settings
#[derive(Debug, Clone)]
pub struct CallConfigBuilder {
    config: CallConfig,
}

impl CallConfigBuilder {
    pub fn setup_timeout(mut self, timeout: Duration) -> Self {
        self.config.setup_timeout_ms = millis(timeout);
        self
    }

    pub fn constraints(mut self, constraints: MediaConstraints) -> Self {
        self.config.constraints = constraints;
        self
    }

    /// Request the microphone only
    pub fn audio_only(self) -> Self {
        self.constraints(MediaConstraints::audio_only())
    }
}
