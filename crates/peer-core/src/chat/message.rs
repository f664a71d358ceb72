//! Chat messages and the append-only log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sender {
    /// Sent from this endpoint
    #[serde(rename = "self")]
    Local,
    /// Received from the remote endpoint
    #[serde(rename = "peer")]
    Peer,
}

/// One entry in the chat log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Position in the log, starting at 0
    pub seq: u64,
    pub text: String,
    pub sender: Sender,
    /// When the message was appended (informational)
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn is_local(&self) -> bool {
        self.sender == Sender::Local
    }
}

/// Ordered log of sent and received messages
///
/// Messages are only ever appended; nothing is edited or removed.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and return it
    pub(crate) fn append(&mut self, text: impl Into<String>, sender: Sender) -> &Message {
        let seq = self.messages.len() as u64;
        self.messages.push(Message {
            seq,
            text: text.into(),
            sender,
            received_at: Utc::now(),
        });
        &self.messages[self.messages.len() - 1]
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }
}

impl<'a> IntoIterator for &'a MessageLog {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
