//! Consumer workflow.
//!
//! Starts a processor on the configured queue, runs until the shutdown future
//! resolves or the processor ends on its own, then stops the processor and
//! closes the client. Stop and close happen on every path.

use std::future::Future;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::{BoxError, Result};
use crate::queue::{
    MessageHandler, ProcessErrorArgs, ProcessMessageArgs, ProcessorOptions, QueueClient,
};

/// Prints each message body and completes it.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintingHandler;

#[async_trait]
impl MessageHandler for PrintingHandler {
    async fn process_message(&self, args: &ProcessMessageArgs) -> Result<(), BoxError> {
        let message = args.message();
        let body = message.body_text();

        println!("Received: {body}");
        info!(
            queue = args.entity_path(),
            message_id = message.message_id().unwrap_or("unknown"),
            delivery_count = message.delivery_count(),
            body_length = message.body().len(),
            "consumer_message_received"
        );

        args.complete_message().await?;
        Ok(())
    }

    async fn process_error(&self, args: ProcessErrorArgs) {
        error!(
            queue = %args.entity_path,
            source = ?args.source,
            lock_token = ?args.lock_token,
            error = %args.error,
            "consumer_error"
        );
    }
}

/// Process messages from `queue` with `handler` until `shutdown` resolves or
/// the subscription ends.
pub async fn run<H, F>(
    client: QueueClient,
    queue: &str,
    options: ProcessorOptions,
    handler: H,
    shutdown: F,
) -> Result<()>
where
    H: MessageHandler,
    F: Future<Output = ()>,
{
    let result = async {
        let processor = client.create_processor(queue, options)?;
        let mut handle = processor.start(handler).await?;

        info!(queue = queue, "consumer_ready");
        tokio::select! {
            _ = shutdown => {
                info!(queue = queue, "consumer_shutdown_requested");
            }
            _ = handle.stopped() => {
                warn!(queue = queue, "consumer_processor_ended");
            }
        }

        handle.stop().await
    }
    .await;

    if let Err(e) = client.close().await {
        warn!(error = %e, "queue_client_close_error");
    }

    info!(queue = queue, "consumer_shutdown_complete");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::time::timeout;

    use crate::queue::{MemoryTransport, OutgoingMessage, Transport};

    const QUEUE: &str = "az204-queue";

    #[tokio::test]
    async fn test_printing_handler_completes_and_client_closes() {
        let transport = MemoryTransport::new();
        let client = QueueClient::with_transport(Arc::new(transport.clone()));
        transport
            .send_batch(
                QUEUE,
                (1..=3).map(|n| OutgoingMessage::text(format!("Message {n}"))).collect(),
            )
            .await
            .unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let watcher = transport.clone();
        tokio::spawn(async move {
            while watcher.completed(QUEUE).len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let _ = stop_tx.send(());
        });

        let shutdown = async {
            let _ = stop_rx.await;
        };
        timeout(
            Duration::from_secs(5),
            run(client, QUEUE, ProcessorOptions::default(), PrintingHandler, shutdown),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(transport.completed(QUEUE).len(), 3);
        assert_eq!(transport.locked_count(QUEUE), 0);
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_immediate_shutdown_releases_everything() {
        let transport = MemoryTransport::new();
        let client = QueueClient::with_transport(Arc::new(transport.clone()));

        run(client, QUEUE, ProcessorOptions::default(), PrintingHandler, async {})
            .await
            .unwrap();

        assert!(transport.is_closed());
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_still_closes_client() {
        let transport = MemoryTransport::new();
        let client = QueueClient::with_transport(Arc::new(transport.clone()));
        // Subscribing fails on a closed transport
        transport.close().await.unwrap();

        let result = run(client, QUEUE, ProcessorOptions::default(), PrintingHandler, async {}).await;
        assert!(result.is_err());
        assert_eq!(transport.close_calls(), 2);
    }

    struct CountingErrors {
        errors: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageHandler for CountingErrors {
        async fn process_message(&self, args: &ProcessMessageArgs) -> Result<(), BoxError> {
            args.complete_message().await?;
            Ok(())
        }

        async fn process_error(&self, _args: ProcessErrorArgs) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_returns_when_transport_closes_without_shutdown() {
        let transport = MemoryTransport::new();
        let client = QueueClient::with_transport(Arc::new(transport.clone()));
        let errors = Arc::new(AtomicUsize::new(0));

        let closer = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            closer.close().await.unwrap();
        });

        let handler = CountingErrors {
            errors: Arc::clone(&errors),
        };
        timeout(
            Duration::from_secs(5),
            run(client, QUEUE, ProcessorOptions::default(), handler, std::future::pending()),
        )
        .await
        .expect("run kept waiting after the subscription ended")
        .unwrap();

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(transport.is_closed());
    }
}
