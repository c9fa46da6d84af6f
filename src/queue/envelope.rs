//! Message envelope.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::codec::base64_bytes;

/// Well-known header names.
pub mod headers {
    /// Address of the queue a failed message originally came from. Set by
    /// the host's error handling; read when returning a message to source.
    pub const FAILED_QUEUE: &str = "redbus.FailedQ";
}

/// Why a message is being sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageIntent {
    #[default]
    Send,
    Publish,
    Subscribe,
    Unsubscribe,
    Reply,
}

/// A message as stored in a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Empty until assigned by `send`.
    #[serde(default)]
    pub id: String,
    /// Opaque payload.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub reply_to_address: Option<Address>,
    #[serde(default)]
    pub intent: MessageIntent,
    /// Informational only: queues never discard stale messages.
    #[serde(default)]
    pub time_to_be_received: Option<Duration>,
    #[serde(default = "recoverable_default")]
    pub recoverable: bool,
}

fn recoverable_default() -> bool {
    true
}

impl Envelope {
    /// New envelope with no id; `send` assigns one.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: String::new(),
            body: body.into(),
            headers: HashMap::new(),
            correlation_id: None,
            reply_to_address: None,
            intent: MessageIntent::Send,
            time_to_be_received: None,
            recoverable: true,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Assign a fresh id if none is set. Returns the id.
    pub(crate) fn ensure_id(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        &self.id
    }
}
