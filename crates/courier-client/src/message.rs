//! Message and destination types shared by every layer of the client.
//!
//! A [`Message`] carries a text (or raw bytes) body, a string property map,
//! and the metadata needed for request/reply correlation: an opaque
//! correlation id, an optional reply-to address, a send timestamp, and an
//! absolute expiration.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Default message priority (mid-range of 0-9).
pub const DEFAULT_PRIORITY: u8 = 4;

/// A transport address a message can be sent to or received from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// A named queue: each message is delivered to exactly one consumer.
    Queue(String),
    /// A named topic: each message is fanned out to every subscriber.
    Topic(String),
    /// A temporary queue scoped to one connection, used as a reply address.
    Temporary(String),
}

impl Destination {
    /// Creates a queue destination.
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue(name.into())
    }

    /// Creates a topic destination.
    pub fn topic(name: impl Into<String>) -> Self {
        Self::Topic(name.into())
    }

    /// Returns the destination's name without its kind.
    pub fn name(&self) -> &str {
        match self {
            Self::Queue(n) | Self::Topic(n) | Self::Temporary(n) => n,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue(n) => write!(f, "queue:{n}"),
            Self::Topic(n) => write!(f, "topic:{n}"),
            Self::Temporary(n) => write!(f, "temp:{n}"),
        }
    }
}

/// Message payload. The client is text-oriented; byte payloads exist only so
/// inbound dispatch can reject them explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    /// UTF-8 text payload.
    Text(String),
    /// Opaque byte payload.
    Bytes(Vec<u8>),
}

/// A single transport message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message payload.
    pub body: Body,
    /// String header properties, copied verbatim between legs.
    pub properties: HashMap<String, String>,
    /// Correlation id matching a reply to its request.
    pub correlation_id: Option<String>,
    /// Where the handler should send its result.
    pub reply_to: Option<Destination>,
    /// Delivery priority, 0-9.
    pub priority: u8,
    /// Milliseconds since UNIX epoch, stamped by the producer at send time.
    pub timestamp_ms: u64,
    /// Absolute expiry as milliseconds since UNIX epoch; 0 means no expiry.
    pub expiration_ms: u64,
}

impl Message {
    /// Creates a text message with no properties and default priority.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: Body::Text(body.into()),
            properties: HashMap::new(),
            correlation_id: None,
            reply_to: None,
            priority: DEFAULT_PRIORITY,
            timestamp_ms: 0,
            expiration_ms: 0,
        }
    }

    /// Returns the text body, or a transport error for byte payloads.
    pub fn text_body(&self) -> Result<&str> {
        match &self.body {
            Body::Text(s) => Ok(s),
            Body::Bytes(_) => Err(ClientError::transport(
                "received message is not a text message",
            )),
        }
    }

    /// Remaining lifetime relative to the original send: expiration minus
    /// timestamp. `None` when no expiration is set.
    pub fn remaining_lifetime(&self) -> Option<Duration> {
        if self.expiration_ms > 0 {
            Some(Duration::from_millis(
                self.expiration_ms.saturating_sub(self.timestamp_ms),
            ))
        } else {
            None
        }
    }

    /// Returns `true` if an expiration is set and has passed.
    pub fn is_expired(&self) -> bool {
        self.expiration_ms > 0 && self.expiration_ms <= epoch_ms()
    }
}

/// Current time as milliseconds since UNIX epoch.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
