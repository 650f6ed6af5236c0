//! Outbound middleware pipeline.
//!
//! Every message leaving `send`, `request`, `reply` or `publish` is threaded
//! through the registered middleware in order. Each middleware decides whether
//! to continue by calling [`Next::run`]; returning an error aborts the send.
//!
//! The pipeline is not transactional: if a later middleware fails, changes an
//! earlier one made to the message stay applied to the (discarded) message.

use crate::message::Message;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, message: &mut Message, next: Next<'_>) -> Result<()>;
}

/// Continuation into the rest of the chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>]) -> Self {
        Self { chain }
    }

    /// Run the remaining middleware against `message`.
    pub async fn run(self, message: &mut Message) -> Result<()> {
        match self.chain.split_first() {
            Some((head, tail)) => head.handle(message, Next { chain: tail }).await,
            None => Ok(()),
        }
    }
}

/// Middleware from a synchronous closure that inspects or mutates the message
/// and then always continues the chain.
pub struct FnMiddleware<F> {
    f: F,
}

impl<F> FnMiddleware<F>
where
    F: Fn(&mut Message) -> Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut Message) -> Result<()> + Send + Sync,
{
    async fn handle(&self, message: &mut Message, next: Next<'_>) -> Result<()> {
        (self.f)(message)?;
        next.run(message).await
    }
}
