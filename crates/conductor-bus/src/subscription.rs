//! Subscriptions and message handlers.

use crate::message::{Message, Priority};
use crate::topic::topic_matches;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

pub type SubscriptionId = String;

/// Receives messages routed to a subscription.
///
/// Returning an error records the message as a dead letter; it never reaches
/// the sender and does not stop delivery to other subscriptions.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> Result<()> {
        (self)(message.clone()).await
    }
}

/// Optional predicates and limits for a subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Secondary pattern tried when the subscription topic does not match.
    pub filter: Option<String>,
    /// Only accept messages from these senders.
    pub from_agents: Option<Vec<String>>,
    /// Only accept messages at least this urgent.
    pub min_priority: Option<Priority>,
    /// Remove the subscription after this many successful deliveries.
    pub max_messages: Option<usize>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, pattern: impl Into<String>) -> Self {
        self.filter = Some(pattern.into());
        self
    }

    pub fn from_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.from_agents = Some(agents.into_iter().map(Into::into).collect());
        self
    }

    pub fn min_priority(mut self, priority: Priority) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn max_messages(mut self, max: usize) -> Self {
        self.max_messages = Some(max);
        self
    }
}

/// A standing interest registration.
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub options: SubscribeOptions,
    pub(crate) handler: Arc<dyn MessageHandler>,
    /// Successful deliveries so far.
    pub message_count: usize,
    /// Deliveries currently running; counted against `max_messages`.
    pub(crate) reserved: usize,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub(crate) fn new(
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            options,
            handler,
            message_count: 0,
            reserved: 0,
            created_at: Utc::now(),
        }
    }

    /// Whether this subscription accepts the message.
    pub fn matches(&self, message: &Message) -> bool {
        let topic_ok = topic_matches(&self.topic, &message.topic)
            || self
                .options
                .filter
                .as_deref()
                .is_some_and(|filter| topic_matches(filter, &message.topic));
        if !topic_ok {
            return false;
        }

        if let Some(allowed) = &self.options.from_agents {
            if !allowed.iter().any(|agent| *agent == message.from) {
                return false;
            }
        }

        if let Some(threshold) = self.options.min_priority {
            if !message.priority.at_least(threshold) {
                return false;
            }
        }

        true
    }

    /// Whether another delivery may start without exceeding `max_messages`.
    pub(crate) fn has_capacity(&self) -> bool {
        match self.options.max_messages {
            Some(max) => self.message_count + self.reserved < max,
            None => true,
        }
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.options
            .max_messages
            .is_some_and(|max| self.message_count >= max)
    }

    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id.clone(),
            topic: self.topic.clone(),
            options: self.options.clone(),
            message_count: self.message_count,
            created_at: self.created_at,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("options", &self.options)
            .field("message_count", &self.message_count)
            .finish_non_exhaustive()
    }
}

/// Handler-free snapshot of a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub topic: String,
    pub options: SubscribeOptions,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
}
