//! Seam between the client types and a concrete broker.

use async_trait::async_trait;

use super::types::{OutgoingMessage, ReceivedMessage};
use crate::error::Result;

/// A broker connection able to send batches and open subscriptions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Enqueue all `messages` on `queue` atomically, in order.
    async fn send_batch(&self, queue: &str, messages: Vec<OutgoingMessage>) -> Result<()>;

    /// Start receiving from `queue`, keeping at most `prefetch` unsettled deliveries.
    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Subscription>>;

    /// Release the underlying connection.
    async fn close(&self) -> Result<()>;
}

/// An open receive stream on one queue.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. `None` means the stream has ended.
    ///
    /// Must be cancel safe: dropping the future loses no message.
    async fn next_message(&mut self) -> Option<Result<ReceivedMessage>>;

    /// Stop receiving. Unsettled deliveries become available again.
    async fn close(self: Box<Self>) -> Result<()>;
}
