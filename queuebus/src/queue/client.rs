//! Queue client and sender.
//!
//! The client owns the broker connection; senders and processors borrow it
//! through a shared handle. Closing the client is idempotent and makes every
//! later operation fail with [`QueueError::Closed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use super::amqp::AmqpTransport;
use super::batch::MessageBatch;
use super::connection::ConnectionString;
use super::processor::{Processor, ProcessorOptions};
use super::transport::Transport;
use crate::config::DEFAULT_MAX_BATCH_SIZE_BYTES;
use crate::error::{QueueError, Result};

pub(crate) struct ClientInner {
    pub(crate) transport: Arc<dyn Transport>,
    closed: AtomicBool,
}

impl ClientInner {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed("queue client"));
        }
        Ok(())
    }
}

/// Connection to a queue broker.
#[derive(Clone)]
pub struct QueueClient {
    inner: Arc<ClientInner>,
}

impl QueueClient {
    /// Connect to the broker named by `connection_string`.
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let connection_string = ConnectionString::parse(connection_string)?;
        let transport = AmqpTransport::connect(&connection_string).await?;
        Ok(Self::with_transport(Arc::new(transport)))
    }

    /// Wrap an already connected transport.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }

    /// Create a sender for `queue`.
    pub fn create_sender(&self, queue: &str) -> Result<Sender> {
        self.inner.ensure_open()?;
        Ok(Sender {
            client: Arc::clone(&self.inner),
            queue: queue.to_string(),
            max_batch_size_bytes: DEFAULT_MAX_BATCH_SIZE_BYTES,
            closed: false,
        })
    }

    /// Create a processor receiving from `queue`. Nothing is received until it is started.
    pub fn create_processor(&self, queue: &str, options: ProcessorOptions) -> Result<Processor> {
        self.inner.ensure_open()?;
        Ok(Processor::new(Arc::clone(&self.inner), queue, options))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the underlying connection. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inner.transport.close().await?;
        info!(transport = self.transport_name(), "queue_client_closed");
        Ok(())
    }
}

/// Sends batches of messages to a single queue.
pub struct Sender {
    client: Arc<ClientInner>,
    queue: String,
    max_batch_size_bytes: usize,
    closed: bool,
}

impl Sender {
    /// Override the batch size limit used by [`Sender::create_message_batch`].
    pub fn with_max_batch_size(mut self, max_size_bytes: usize) -> Self {
        self.max_batch_size_bytes = max_size_bytes;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(QueueError::Closed("sender"));
        }
        self.client.ensure_open()
    }

    /// Start an empty batch bounded by this sender's size limit.
    pub fn create_message_batch(&self) -> Result<MessageBatch> {
        self.ensure_open()?;
        Ok(MessageBatch::new(self.max_batch_size_bytes))
    }

    /// Submit every message of `batch` in one operation. An empty batch sends nothing.
    pub async fn send_batch(&self, batch: MessageBatch) -> Result<()> {
        self.ensure_open()?;

        if batch.is_empty() {
            warn!(queue = %self.queue, "queue_empty_batch_skipped");
            return Ok(());
        }

        let count = batch.len();
        let size_bytes = batch.size_bytes();

        self.client
            .transport
            .send_batch(&self.queue, batch.into_messages())
            .await?;

        info!(
            queue = %self.queue,
            count = count,
            size_bytes = size_bytes,
            "queue_batch_sent"
        );
        Ok(())
    }

    /// Release the sender. Calling it again is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            info!(queue = %self.queue, "queue_sender_closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryTransport;
    use crate::queue::types::OutgoingMessage;

    fn client() -> (MemoryTransport, QueueClient) {
        let transport = MemoryTransport::new();
        let client = QueueClient::with_transport(Arc::new(transport.clone()));
        (transport, client)
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, client) = client();
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.is_closed());
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_closed_client_rejects_new_work() {
        let (_, client) = client();
        client.close().await.unwrap();
        assert!(matches!(client.create_sender("q"), Err(QueueError::Closed(_))));
        assert!(matches!(
            client.create_processor("q", ProcessorOptions::default()),
            Err(QueueError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_sender_fails_after_client_close() {
        let (transport, client) = client();
        let sender = client.create_sender("q").unwrap();
        let mut batch = sender.create_message_batch().unwrap();
        assert!(batch.try_add(OutgoingMessage::text("x")));

        client.close().await.unwrap();
        assert!(matches!(sender.send_batch(batch).await, Err(QueueError::Closed(_))));
        assert!(transport.sent_batches().is_empty());
    }

    #[tokio::test]
    async fn test_closed_sender_rejects_batches() {
        let (_, client) = client();
        let mut sender = client.create_sender("q").unwrap();
        sender.close().await.unwrap();
        sender.close().await.unwrap();
        assert!(matches!(sender.create_message_batch(), Err(QueueError::Closed("sender"))));
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_sent() {
        let (transport, client) = client();
        let sender = client.create_sender("q").unwrap();
        let batch = sender.create_message_batch().unwrap();
        sender.send_batch(batch).await.unwrap();
        assert!(transport.sent_batches().is_empty());
    }

    #[tokio::test]
    async fn test_batch_uses_sender_limit() {
        let (_, client) = client();
        let sender = client.create_sender("q").unwrap().with_max_batch_size(512);
        assert_eq!(sender.create_message_batch().unwrap().max_size_bytes(), 512);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_connection_string() {
        let err = QueueClient::connect("Endpoint=sb://ns/;SharedAccessKey=k")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::InvalidConnectionString(_)));
    }
}
