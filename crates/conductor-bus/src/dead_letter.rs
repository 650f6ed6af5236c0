//! Dead-letter queue.
//!
//! Holds messages that could not be routed or whose handler failed, for later
//! inspection or redelivery. Bounded: once full, the oldest entry is evicted.

use crate::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default maximum number of retained dead letters.
pub const DEFAULT_MAX_DEAD_LETTERS: usize = 1000;

/// Reason recorded when a directed message matches no subscription.
pub const NO_MATCHING_SUBSCRIPTION: &str = "No matching subscription";

/// A message that failed delivery or handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    /// Reason of the most recent failure.
    pub reason: String,
    /// When the message first failed.
    pub failed_at: DateTime<Utc>,
    /// Number of failures recorded for this message id.
    pub attempts: u32,
}

/// Bounded ring of dead letters keyed by message id.
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: VecDeque<DeadLetter>,
    capacity: usize,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a failure for `message`.
    ///
    /// A repeated failure of the same message id bumps `attempts` on the
    /// existing entry instead of adding a new one. Returns the entry as stored
    /// and whether it was newly added.
    pub fn push(&mut self, message: &Message, reason: impl Into<String>) -> (DeadLetter, bool) {
        let reason = reason.into();

        if let Some(existing) = self.entries.iter_mut().find(|dl| dl.message.id == message.id) {
            existing.attempts += 1;
            existing.reason = reason;
            return (existing.clone(), false);
        }

        let entry = DeadLetter {
            message: message.clone(),
            reason,
            failed_at: Utc::now(),
            attempts: 1,
        };
        self.entries.push_back(entry.clone());
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        (entry, true)
    }

    pub fn get(&self, message_id: &str) -> Option<&DeadLetter> {
        self.entries.iter().find(|dl| dl.message.id == message_id)
    }

    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries.iter().cloned().collect()
    }

    /// Remove every entry, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEAD_LETTERS)
    }
}
