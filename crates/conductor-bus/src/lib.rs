//! In-process message bus for agent coordination.
//!
//! Agents exchange [`Message`]s by topic. The bus supports directed sends,
//! broadcasts, request/response with correlation ids and timeouts, an
//! outbound middleware chain and a bounded dead-letter queue.
//!
//! # Example
//!
//! ```no_run
//! use conductor_bus::{MessageBus, SendOptions, SubscribeOptions, Message};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let bus = MessageBus::default();
//!
//! bus.subscribe(
//!     "guardian.*",
//!     |msg: Message| async move {
//!         println!("{} -> {}", msg.from, msg.topic);
//!         Ok::<_, anyhow::Error>(())
//!     },
//!     SubscribeOptions::new(),
//! )?;
//!
//! bus.publish("lyria", "guardian.shinkami", json!({"task": "scan"}), SendOptions::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod dead_letter;
pub mod error;
pub mod events;
pub mod message;
pub mod middleware;
pub mod stats;
pub mod subscription;
pub mod topic;

pub use bus::{BusConfig, MessageBus};
pub use dead_letter::{DeadLetter, DeadLetterQueue, NO_MATCHING_SUBSCRIPTION};
pub use error::{BusError, BusResult};
pub use events::BusEvent;
pub use message::{
    CorrelationId, Message, MessageId, MessageKind, Priority, SendOptions, BROADCAST,
};
pub use middleware::{FnMiddleware, Middleware, Next};
pub use stats::BusStats;
pub use subscription::{
    MessageHandler, SubscribeOptions, Subscription, SubscriptionId, SubscriptionInfo,
};
pub use topic::{is_wildcard, topic_matches};
