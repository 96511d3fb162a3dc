//! Message types exchanged with the queue.
//!
//! - [`OutgoingMessage`]: a payload the application wants to enqueue
//! - [`ReceivedMessage`]: a delivery handed out by the broker, settled through
//!   its lock token

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::{QueueError, Result};

/// Content type used for text bodies.
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// A message waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Raw payload
    pub body: Vec<u8>,
    /// Optional application message identifier
    pub message_id: Option<String>,
    /// Optional MIME content type
    pub content_type: Option<String>,
}

impl OutgoingMessage {
    /// Create a message from raw bytes.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            message_id: None,
            content_type: None,
        }
    }

    /// Create a `text/plain` message.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into().into_bytes(),
            message_id: None,
            content_type: Some(TEXT_CONTENT_TYPE.to_string()),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Body decoded as UTF-8 (lossy).
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Transport-specific acknowledgement of a single delivery.
#[async_trait]
pub trait Settlement: Send + Sync {
    /// Remove the message from the queue.
    async fn complete(&self) -> Result<()>;

    /// Release the lock so the message is delivered again.
    async fn abandon(&self) -> Result<()>;
}

/// A message delivered by the broker.
///
/// The message stays locked until it is completed or abandoned. Settling it
/// twice returns [`QueueError::AlreadySettled`].
pub struct ReceivedMessage {
    body: Vec<u8>,
    message_id: Option<String>,
    delivery_count: u32,
    lock_token: u64,
    settlement: Box<dyn Settlement>,
    settled: AtomicBool,
}

impl ReceivedMessage {
    pub fn new(
        body: Vec<u8>,
        message_id: Option<String>,
        delivery_count: u32,
        lock_token: u64,
        settlement: Box<dyn Settlement>,
    ) -> Self {
        Self {
            body,
            message_id,
            delivery_count,
            lock_token,
            settlement,
            settled: AtomicBool::new(false),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body decoded as UTF-8 (lossy).
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Number of times this message has been handed out, starting at 1.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn lock_token(&self) -> u64 {
        self.lock_token
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Acknowledge the message so the broker deletes it.
    pub async fn complete(&self) -> Result<()> {
        self.settle(true).await
    }

    /// Give the message back to the queue for redelivery.
    pub async fn abandon(&self) -> Result<()> {
        self.settle(false).await
    }

    async fn settle(&self, complete: bool) -> Result<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(QueueError::AlreadySettled(self.lock_token));
        }

        let result = if complete {
            self.settlement.complete().await
        } else {
            self.settlement.abandon().await
        };

        // A failed settlement leaves the lock in place
        if result.is_err() {
            self.settled.store(false, Ordering::Release);
        }
        result
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("message_id", &self.message_id)
            .field("delivery_count", &self.delivery_count)
            .field("lock_token", &self.lock_token)
            .field("body_length", &self.body.len())
            .field("settled", &self.is_settled())
            .finish()
    }
}
