//! Batch publishing workflow.
//!
//! ```text
//! client → sender → batch ("Message 1".."Message N") → send_batch → close sender → close client
//! ```

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{QueueError, Result};
use crate::queue::{OutgoingMessage, QueueClient, Sender};

/// Body of the `n`-th published message (1-based).
pub fn message_body(n: usize) -> String {
    format!("Message {n}")
}

/// Build a batch of `count` text messages and send it with `sender`.
async fn fill_and_send(sender: &Sender, count: usize) -> Result<usize> {
    let mut batch = sender.create_message_batch()?;

    for n in 1..=count {
        let message = OutgoingMessage::text(message_body(n)).with_message_id(format!("message-{n}"));
        if !batch.try_add(message) {
            return Err(QueueError::BatchOverflow {
                message_number: n,
                size_bytes: batch.size_bytes(),
                max_size_bytes: batch.max_size_bytes(),
            });
        }
    }

    let sent = batch.len();
    sender.send_batch(batch).await?;
    Ok(sent)
}

/// Publish `count` messages to `queue` as a single batch.
///
/// Nothing is sent when any message fails to fit. The sender is closed on
/// every path; the client is left open.
pub async fn publish_messages(
    client: &QueueClient,
    queue: &str,
    count: usize,
    max_batch_size_bytes: usize,
) -> Result<usize> {
    let mut sender = client
        .create_sender(queue)?
        .with_max_batch_size(max_batch_size_bytes);

    let result = fill_and_send(&sender, count).await;

    if let Err(e) = sender.close().await {
        warn!(queue = queue, error = %e, "queue_sender_close_error");
    }

    match &result {
        Ok(sent) => info!(queue = queue, count = sent, "publish_complete"),
        Err(e) => warn!(queue = queue, error = %e, "publish_failed"),
    }
    result
}

/// Run the publisher with `config` and close `client` afterwards, whatever the outcome.
pub async fn run(client: QueueClient, config: &Config) -> Result<usize> {
    let result = publish_messages(
        &client,
        &config.queue_name,
        config.message_count,
        config.max_batch_size_bytes,
    )
    .await;

    if let Err(e) = client.close().await {
        warn!(error = %e, "queue_client_close_error");
    }

    result
}
