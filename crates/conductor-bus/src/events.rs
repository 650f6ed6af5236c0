//! Observer notifications emitted by the bus.

use crate::message::{Message, MessageId};
use crate::subscription::SubscriptionId;
use serde::{Deserialize, Serialize};

/// Bus lifecycle notification.
///
/// Published on a broadcast channel; observers that fall behind lose the
/// oldest events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    MessageSent {
        message: Message,
    },
    MessageDelivered {
        message_id: MessageId,
        subscription_id: SubscriptionId,
    },
    MessageFailed {
        message_id: MessageId,
        subscription_id: SubscriptionId,
        reason: String,
    },
    MessageExpired {
        message: Message,
    },
    SubscriptionAdded {
        subscription_id: SubscriptionId,
        topic: String,
    },
    SubscriptionRemoved {
        subscription_id: SubscriptionId,
        topic: String,
    },
    DeadLetterAdded {
        message_id: MessageId,
        reason: String,
    },
}

impl BusEvent {
    /// External event name.
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::MessageSent { .. } => "message:sent",
            BusEvent::MessageDelivered { .. } => "message:delivered",
            BusEvent::MessageFailed { .. } => "message:failed",
            BusEvent::MessageExpired { .. } => "message:expired",
            BusEvent::SubscriptionAdded { .. } => "subscription:added",
            BusEvent::SubscriptionRemoved { .. } => "subscription:removed",
            BusEvent::DeadLetterAdded { .. } => "deadletter:added",
        }
    }
}
