//! Messages exchanged over the bus.
//!
//! A message is routed by `topic`, addressed `from` one agent `to` another
//! (or to everyone via [`BROADCAST`]), and optionally linked to a request by
//! its `correlation_id`.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Recipient sentinel for broadcast messages.
pub const BROADCAST: &str = "*";

pub type MessageId = String;
pub type CorrelationId = String;

/// What a message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Fire-and-forget notification.
    Event,
    /// Expects a `Response` carrying the same correlation id.
    Request,
    /// Answer to an earlier `Request`.
    Response,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Event => "event",
            MessageKind::Request => "request",
            MessageKind::Response => "response",
        };
        f.write_str(name)
    }
}

/// Delivery urgency. `Critical` is the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Numeric rank; lower is more urgent.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    /// Whether this priority is at least as urgent as `threshold`.
    pub fn at_least(self, threshold: Priority) -> bool {
        self.rank() <= threshold.rank()
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    /// Orders by urgency: `Critical < High < Normal < Low`.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Per-call overrides for the send-like operations.
///
/// Anything left as `None` falls back to the bus configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendOptions {
    pub priority: Option<Priority>,
    /// Time to live in milliseconds. `Some(0)` disables expiry.
    pub ttl_ms: Option<u64>,
    /// Response deadline for `request`, in milliseconds.
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A typed message sent between agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID.
    pub id: MessageId,
    /// Links a request to its response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Sender agent ID.
    pub from: String,
    /// Recipient agent ID, or [`BROADCAST`].
    pub to: String,
    /// Dot-segmented routing key, e.g. `guardian.shinkami.task`.
    pub topic: String,
    pub kind: MessageKind,
    /// Message payload (JSON).
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// Milliseconds after `timestamp` during which the message may be delivered.
    /// Zero means it never expires.
    pub ttl_ms: u64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    /// Create a new event message with default priority and no expiry.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            from: from.into(),
            to: to.into(),
            topic: topic.into(),
            kind: MessageKind::Event,
            payload,
            priority: Priority::Normal,
            timestamp: Utc::now(),
            ttl_ms: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Build the response to this message: sender and recipient swapped,
    /// same topic and correlation id.
    ///
    /// Returns `None` when this message carries no correlation id.
    pub fn reply(&self, payload: serde_json::Value) -> Option<Self> {
        let correlation_id = self.correlation_id.clone()?;
        Some(Self {
            id: uuid::Uuid::new_v4().to_string(),
            correlation_id: Some(correlation_id),
            from: self.to.clone(),
            to: self.from.clone(),
            topic: self.topic.clone(),
            kind: MessageKind::Response,
            payload,
            priority: self.priority,
            timestamp: Utc::now(),
            ttl_ms: self.ttl_ms,
            metadata: HashMap::new(),
        })
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST
    }

    /// Whether the TTL has elapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_ms == 0 {
            return false;
        }
        let age_ms = (now - self.timestamp).num_milliseconds();
        u64::try_from(age_ms).is_ok_and(|age| age > self.ttl_ms)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Deserialize the payload as a specific type.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        T::deserialize(self.payload.clone())
            .map_err(|e| anyhow!("Failed to deserialize message payload: {}", e))
    }
}
