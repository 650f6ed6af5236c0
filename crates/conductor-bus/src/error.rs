//! Error type for bus operations.

use thiserror::Error;

/// Errors surfaced synchronously to callers of the bus.
///
/// Handler failures and unroutable messages are never returned here; they
/// end up in the dead-letter queue instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// A request received no response before its deadline.
    #[error("Request timeout after {timeout_ms}ms: {topic}")]
    Timeout { topic: String, timeout_ms: u64 },

    /// The bus was torn down; no further operations are accepted.
    #[error("Bus destroyed")]
    Destroyed,

    /// `reply` was called on a message that is not part of a request.
    #[error("Cannot reply to message {message_id}: it has no correlation id")]
    MissingCorrelationId { message_id: String },

    /// Too many requests are waiting for a response.
    #[error("Too many in-flight requests ({in_flight}/{limit})")]
    Backpressure { in_flight: usize, limit: usize },

    /// A middleware aborted the send.
    #[error("Middleware rejected message: {0}")]
    Middleware(String),
}

pub type BusResult<T> = Result<T, BusError>;
