//! The message bus.
//!
//! Provides:
//! - Directed sends and topic broadcasts
//! - Request/response with correlation ids and timeouts
//! - Middleware on every outbound message
//! - A bounded dead-letter queue for unroutable or failed messages
//! - TTL expiry, optional history and delivery statistics
//!
//! Delivery finishes inside the sending call, so messages from one sender
//! reach a fixed set of subscribers in send order. Fan-out follows
//! subscription registration order. Registry locks are never held while a
//! handler or middleware runs.

use crate::dead_letter::{DeadLetter, DeadLetterQueue, NO_MATCHING_SUBSCRIPTION};
use crate::error::{BusError, BusResult};
use crate::events::BusEvent;
use crate::message::{CorrelationId, Message, MessageId, MessageKind, SendOptions, BROADCAST};
use crate::middleware::{Middleware, Next};
use crate::stats::{BusStats, LatencyWindow};
use crate::subscription::{
    MessageHandler, SubscribeOptions, Subscription, SubscriptionId, SubscriptionInfo,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Default time to live for messages (milliseconds).
pub const DEFAULT_TTL_MS: u64 = 30_000;

/// Default response deadline for requests (milliseconds).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Default cap on concurrently outstanding requests.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 10_000;

/// Default size of the history ring.
pub const DEFAULT_MAX_HISTORY: usize = 5000;

/// Default buffer of the observer event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Configuration for a [`MessageBus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Maximum number of retained dead letters.
    #[serde(default = "default_max_dead_letters")]
    pub max_dead_letters: usize,

    /// TTL applied when a send does not specify one. Zero disables expiry.
    #[serde(default = "default_ttl")]
    pub default_ttl_ms: u64,

    /// Request deadline applied when a request does not specify one.
    #[serde(default = "default_timeout")]
    pub default_timeout_ms: u64,

    /// Requests beyond this many outstanding ones are refused.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Whether to keep delivered messages in a history ring.
    #[serde(default)]
    pub track_history: bool,

    /// Size of the history ring.
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Buffer size of the observer event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_dead_letters() -> usize {
    crate::dead_letter::DEFAULT_MAX_DEAD_LETTERS
}

fn default_ttl() -> u64 {
    DEFAULT_TTL_MS
}

fn default_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_dead_letters: default_max_dead_letters(),
            default_ttl_ms: DEFAULT_TTL_MS,
            default_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            track_history: false,
            max_history: DEFAULT_MAX_HISTORY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_sent: u64,
    total_delivered: u64,
    total_failed: u64,
    total_expired: u64,
}

/// Subscriptions in registration order plus a topic index.
#[derive(Default)]
struct Registry {
    subscriptions: Vec<Subscription>,
    topic_index: HashMap<String, HashSet<SubscriptionId>>,
}

impl Registry {
    fn insert(&mut self, subscription: Subscription) {
        self.topic_index
            .entry(subscription.topic.clone())
            .or_default()
            .insert(subscription.id.clone());
        self.subscriptions.push(subscription);
    }

    fn remove(&mut self, id: &str) -> Option<Subscription> {
        let position = self.subscriptions.iter().position(|s| s.id == id)?;
        let subscription = self.subscriptions.remove(position);
        if let Some(ids) = self.topic_index.get_mut(&subscription.topic) {
            ids.remove(id);
            if ids.is_empty() {
                self.topic_index.remove(&subscription.topic);
            }
        }
        Some(subscription)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Subscription> {
        self.subscriptions.iter_mut().find(|s| s.id == id)
    }

    fn clear(&mut self) {
        self.subscriptions.clear();
        self.topic_index.clear();
    }
}

struct BusState {
    registry: Registry,
    pending: HashMap<CorrelationId, oneshot::Sender<BusResult<Message>>>,
    middleware: Vec<Arc<dyn Middleware>>,
    dead_letters: DeadLetterQueue,
    history: VecDeque<Message>,
    latency: LatencyWindow,
    counters: Counters,
}

struct Inner {
    config: BusConfig,
    state: Mutex<BusState>,
    events: broadcast::Sender<BusEvent>,
    destroyed: AtomicBool,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: BusEvent) {
        // No observers is fine.
        let _ = self.events.send(event);
    }

    fn record_dead_letter(&self, state: &mut BusState, message: &Message, reason: String) {
        warn!(
            message_id = %message.id,
            topic = %message.topic,
            to = %message.to,
            "Dead letter: {}",
            reason
        );
        let (entry, added) = state.dead_letters.push(message, reason);
        if added {
            self.emit(BusEvent::DeadLetterAdded {
                message_id: entry.message.id,
                reason: entry.reason,
            });
        }
    }

    fn remove_subscription(&self, state: &mut BusState, id: &str) -> bool {
        match state.registry.remove(id) {
            Some(subscription) => {
                debug!("Removed subscription {} on '{}'", id, subscription.topic);
                self.emit(BusEvent::SubscriptionRemoved {
                    subscription_id: subscription.id,
                    topic: subscription.topic,
                });
                true
            }
            None => false,
        }
    }
}

/// Releases a `max_messages` slot taken for an in-progress delivery, even if
/// the delivering future is dropped part-way.
struct ReservedSlot {
    inner: Arc<Inner>,
    subscription_id: SubscriptionId,
}

impl Drop for ReservedSlot {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        if let Some(subscription) = state.registry.get_mut(&self.subscription_id) {
            subscription.reserved = subscription.reserved.saturating_sub(1);
        }
    }
}

enum Route {
    Resolved(oneshot::Sender<BusResult<Message>>),
    FanOut(Vec<(SubscriptionId, Arc<dyn MessageHandler>, ReservedSlot)>),
}

/// In-process message bus.
///
/// Cheap to clone; clones share the same registry, so a handler may capture
/// a clone to `reply` to the request it is handling.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl MessageBus {
    /// Create a new message bus.
    pub fn new(config: BusConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let state = BusState {
            registry: Registry::default(),
            pending: HashMap::new(),
            middleware: Vec::new(),
            dead_letters: DeadLetterQueue::new(config.max_dead_letters),
            history: VecDeque::new(),
            latency: LatencyWindow::default(),
            counters: Counters::default(),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                events,
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Send an event to a specific agent.
    ///
    /// Returns once delivery has been attempted; handler failures go to the
    /// dead-letter queue, not to the caller.
    pub async fn send(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> BusResult<MessageId> {
        self.ensure_alive()?;
        let message = self.build(from, to, topic, payload, &options, MessageKind::Event);
        self.dispatch(message).await
    }

    /// Broadcast an event to every matching subscriber.
    ///
    /// A broadcast that matches nobody is not an error and is not dead-lettered.
    pub async fn publish(
        &self,
        from: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> BusResult<MessageId> {
        self.ensure_alive()?;
        let message = self.build(from, BROADCAST, topic, payload, &options, MessageKind::Event);
        self.dispatch(message).await
    }

    /// Send a request and wait for the matching response.
    ///
    /// Fails with [`BusError::Timeout`] when no response arrives within
    /// `options.timeout_ms` (or the configured default), and with
    /// [`BusError::Backpressure`] when too many requests are outstanding.
    pub async fn request(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> BusResult<Message> {
        self.ensure_alive()?;

        let timeout_ms = options
            .timeout_ms
            .unwrap_or(self.inner.config.default_timeout_ms);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let message = self
            .build(from, to, topic, payload, &options, MessageKind::Request)
            .with_correlation_id(correlation_id.clone());
        let topic = message.topic.clone();

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state();
            let limit = self.inner.config.max_in_flight;
            if state.pending.len() >= limit {
                return Err(BusError::Backpressure {
                    in_flight: state.pending.len(),
                    limit,
                });
            }
            state.pending.insert(correlation_id.clone(), tx);
        }
        debug!("Request {} on '{}' awaiting response", correlation_id, topic);

        if let Err(e) = self.dispatch(message).await {
            self.settle_pending(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::Destroyed),
            Err(_) => {
                self.settle_pending(&correlation_id);
                warn!("Request {} on '{}' timed out after {}ms", correlation_id, topic, timeout_ms);
                Err(BusError::Timeout { topic, timeout_ms })
            }
        }
    }

    /// Reply to a request.
    ///
    /// The response goes back to the original sender with the same topic and
    /// correlation id, and completes the waiting `request` call.
    pub async fn reply(
        &self,
        original: &Message,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> BusResult<MessageId> {
        self.ensure_alive()?;
        let mut response = original
            .reply(payload)
            .ok_or_else(|| BusError::MissingCorrelationId {
                message_id: original.id.clone(),
            })?;
        if let Some(priority) = options.priority {
            response.priority = priority;
        }
        response.ttl_ms = options.ttl_ms.unwrap_or(self.inner.config.default_ttl_ms);
        response.metadata = options.metadata;
        self.dispatch(response).await
    }

    /// Run an existing message through middleware and delivery again,
    /// keeping its id. Used to retry dead letters; another failure bumps the
    /// dead letter's attempt count.
    pub async fn redeliver(&self, message: Message) -> BusResult<MessageId> {
        self.ensure_alive()?;
        self.dispatch(message).await
    }

    /// Register a handler for a topic pattern.
    pub fn subscribe<H>(
        &self,
        topic: impl Into<String>,
        handler: H,
        options: SubscribeOptions,
    ) -> BusResult<SubscriptionId>
    where
        H: MessageHandler + 'static,
    {
        self.ensure_alive()?;
        let subscription = Subscription::new(topic, Arc::new(handler), options);
        let id = subscription.id.clone();
        let topic = subscription.topic.clone();

        self.inner.state().registry.insert(subscription);

        debug!("Added subscription {} on '{}'", id, topic);
        self.inner.emit(BusEvent::SubscriptionAdded {
            subscription_id: id.clone(),
            topic,
        });
        Ok(id)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut state = self.inner.state();
        self.inner.remove_subscription(&mut state, subscription_id)
    }

    /// Append a middleware to the outbound pipeline.
    pub fn use_middleware<M>(&self, middleware: M) -> BusResult<()>
    where
        M: Middleware + 'static,
    {
        self.ensure_alive()?;
        self.inner.state().middleware.push(Arc::new(middleware));
        Ok(())
    }

    /// Subscribe to bus lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner
            .state()
            .registry
            .subscriptions
            .iter()
            .map(Subscription::info)
            .collect()
    }

    /// Ids of subscriptions registered with exactly this topic pattern.
    pub fn subscriptions_for(&self, pattern: &str) -> Vec<SubscriptionId> {
        self.inner
            .state()
            .registry
            .topic_index
            .get(pattern)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.state().registry.subscriptions.len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.state().dead_letters.snapshot()
    }

    /// Empty the dead-letter queue, returning how many entries were dropped.
    pub fn clear_dead_letters(&self) -> usize {
        self.inner.state().dead_letters.clear()
    }

    /// Delivered messages, oldest first. Empty unless `track_history` is set.
    pub fn history(&self) -> Vec<Message> {
        self.inner.state().history.iter().cloned().collect()
    }

    pub fn stats(&self) -> BusStats {
        let state = self.inner.state();
        BusStats {
            total_sent: state.counters.total_sent,
            total_delivered: state.counters.total_delivered,
            total_failed: state.counters.total_failed,
            total_expired: state.counters.total_expired,
            dead_letter_count: state.dead_letters.len(),
            in_flight_count: state.pending.len(),
            active_subscriptions: state.registry.subscriptions.len(),
            avg_delivery_ms: state.latency.average_ms(),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Tear the bus down.
    ///
    /// Every waiting request fails with [`BusError::Destroyed`]; subscriptions,
    /// middleware, dead letters, history and counters are cleared. Later calls
    /// fail with [`BusError::Destroyed`].
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut state = self.inner.state();
        let pending = state.pending.len();
        for (_, waiter) in state.pending.drain() {
            let _ = waiter.send(Err(BusError::Destroyed));
        }
        state.registry.clear();
        state.middleware.clear();
        state.dead_letters.clear();
        state.history.clear();
        state.latency.clear();
        state.counters = Counters::default();

        info!("Message bus destroyed ({} pending requests rejected)", pending);
    }

    // --- internal ---

    fn ensure_alive(&self) -> BusResult<()> {
        if self.is_destroyed() {
            Err(BusError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn build(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
        options: &SendOptions,
        kind: MessageKind,
    ) -> Message {
        Message::new(from, to, topic, payload)
            .with_kind(kind)
            .with_priority(options.priority.unwrap_or_default())
            .with_ttl_ms(options.ttl_ms.unwrap_or(self.inner.config.default_ttl_ms))
            .with_metadata(options.metadata.clone())
    }

    /// Drop a pending request entry, if still present.
    fn settle_pending(&self, correlation_id: &str) {
        self.inner.state().pending.remove(correlation_id);
    }

    async fn dispatch(&self, mut message: Message) -> BusResult<MessageId> {
        let chain = self.inner.state().middleware.clone();
        Next::new(&chain)
            .run(&mut message)
            .await
            .map_err(|e| BusError::Middleware(e.to_string()))?;

        let id = message.id.clone();
        self.deliver(message).await;
        Ok(id)
    }

    async fn deliver(&self, message: Message) {
        let started = Instant::now();

        if message.is_expired() {
            self.inner.state().counters.total_expired += 1;
            warn!(message_id = %message.id, topic = %message.topic, "Message expired before delivery");
            self.inner.emit(BusEvent::MessageExpired { message });
            return;
        }

        let route = {
            let mut state = self.inner.state();

            if self.inner.config.track_history {
                state.history.push_back(message.clone());
                while state.history.len() > self.inner.config.max_history {
                    state.history.pop_front();
                }
            }

            state.counters.total_sent += 1;
            self.inner.emit(BusEvent::MessageSent {
                message: message.clone(),
            });

            let waiter = match message.kind {
                MessageKind::Response => message
                    .correlation_id
                    .as_ref()
                    .and_then(|id| state.pending.remove(id)),
                MessageKind::Event | MessageKind::Request => None,
            };

            match waiter {
                Some(waiter) => {
                    state.latency.record(started.elapsed());
                    Route::Resolved(waiter)
                }
                None => Route::FanOut(self.reserve_targets(&mut state, &message)),
            }
        };

        let targets = match route {
            Route::Resolved(waiter) => {
                debug!(
                    "Response {} matched request {:?}",
                    message.id, message.correlation_id
                );
                let _ = waiter.send(Ok(message));
                return;
            }
            Route::FanOut(targets) => targets,
        };

        debug!(
            "Routing {} '{}' from {} to {} subscription(s)",
            message.kind,
            message.topic,
            message.from,
            targets.len()
        );

        let matched = targets.len();
        for (subscription_id, handler, slot) in targets {
            let outcome = AssertUnwindSafe(handler.handle(&message))
                .catch_unwind()
                .await;

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("handler panicked".to_string()),
            };

            self.settle_delivery(&message, &subscription_id, failure, started);
            drop(slot);
        }

        if matched == 0 && !message.is_broadcast() {
            let mut state = self.inner.state();
            self.inner
                .record_dead_letter(&mut state, &message, NO_MATCHING_SUBSCRIPTION.to_string());
        }
    }

    /// Record the outcome of one handler invocation.
    fn settle_delivery(
        &self,
        message: &Message,
        subscription_id: &str,
        failure: Option<String>,
        started: Instant,
    ) {
        let mut state = self.inner.state();
        match failure {
            None => {
                state.counters.total_delivered += 1;
                state.latency.record(started.elapsed());
                let exhausted = match state.registry.get_mut(subscription_id) {
                    Some(subscription) => {
                        subscription.message_count += 1;
                        subscription.is_exhausted()
                    }
                    None => false,
                };
                self.inner.emit(BusEvent::MessageDelivered {
                    message_id: message.id.clone(),
                    subscription_id: subscription_id.to_string(),
                });
                if exhausted {
                    debug!("Subscription {} reached its message limit", subscription_id);
                    self.inner.remove_subscription(&mut state, subscription_id);
                }
            }
            Some(error) => {
                state.counters.total_failed += 1;
                let reason = format!("Handler error: {}", error);
                self.inner.emit(BusEvent::MessageFailed {
                    message_id: message.id.clone(),
                    subscription_id: subscription_id.to_string(),
                    reason: reason.clone(),
                });
                self.inner.record_dead_letter(&mut state, message, reason);
            }
        }
    }

    /// Collect matching subscriptions in registration order, reserving a
    /// delivery slot on each so `max_messages` holds under concurrent sends.
    fn reserve_targets(
        &self,
        state: &mut BusState,
        message: &Message,
    ) -> Vec<(SubscriptionId, Arc<dyn MessageHandler>, ReservedSlot)> {
        let mut targets = Vec::new();
        for subscription in state.registry.subscriptions.iter_mut() {
            if !subscription.matches(message) || !subscription.has_capacity() {
                continue;
            }
            subscription.reserved += 1;
            targets.push((
                subscription.id.clone(),
                subscription.handler.clone(),
                ReservedSlot {
                    inner: self.inner.clone(),
                    subscription_id: subscription.id.clone(),
                },
            ));
        }
        targets
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("config", &self.inner.config)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}
