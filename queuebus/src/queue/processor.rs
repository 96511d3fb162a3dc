//! Background message processor.
//!
//! A [`Processor`] runs the receive loop on a tokio task and calls a
//! [`MessageHandler`] for every delivery and every error. The returned
//! [`ProcessorHandle`] stops the loop: once `stop()` returns, all in-flight
//! callbacks have finished, the subscription is closed and no further callback
//! will run.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::client::ClientInner;
use super::transport::Subscription;
use super::types::ReceivedMessage;
use crate::config::Config;
use crate::error::{BoxError, QueueError, Result};

/// Processor tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorOptions {
    /// Maximum number of `process_message` calls running at once
    pub max_concurrent_calls: usize,
    /// Broker prefetch; 0 means "same as max_concurrent_calls"
    pub prefetch_count: u16,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            prefetch_count: 0,
        }
    }
}

impl ProcessorOptions {
    fn effective_prefetch(&self) -> u16 {
        if self.prefetch_count > 0 {
            self.prefetch_count
        } else {
            u16::try_from(self.max_concurrent_calls.max(1)).unwrap_or(u16::MAX)
        }
    }
}

impl From<&Config> for ProcessorOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_calls: config.max_concurrent_calls,
            prefetch_count: config.prefetch_count,
        }
    }
}

/// Arguments of the message callback.
pub struct ProcessMessageArgs {
    message: ReceivedMessage,
    entity_path: Arc<str>,
}

impl ProcessMessageArgs {
    pub fn message(&self) -> &ReceivedMessage {
        &self.message
    }

    /// Name of the queue the message came from.
    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    /// Acknowledge the message so the broker deletes it.
    pub async fn complete_message(&self) -> Result<()> {
        self.message.complete().await
    }

    /// Hand the message back for redelivery.
    pub async fn abandon_message(&self) -> Result<()> {
        self.message.abandon().await
    }
}

/// Where a reported error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// Receiving from the broker failed
    Receive,
    /// The message callback returned an error
    UserCallback,
    /// Abandoning a message after a callback error failed
    Abandon,
}

/// Arguments of the error callback.
#[derive(Debug)]
pub struct ProcessErrorArgs {
    pub error: QueueError,
    pub source: ErrorSource,
    pub entity_path: String,
    /// Lock token of the message involved, if any
    pub lock_token: Option<u64>,
}

/// The two callbacks driven by a [`Processor`].
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one delivery. Returning an error reports it through
    /// [`MessageHandler::process_error`] and abandons the message if it was
    /// not settled.
    async fn process_message(&self, args: &ProcessMessageArgs) -> Result<(), BoxError>;

    /// Observe an error. The receive loop keeps running afterwards, except
    /// when the subscription itself has ended.
    async fn process_error(&self, args: ProcessErrorArgs);
}

/// Not yet started receive loop on one queue.
pub struct Processor {
    client: Arc<ClientInner>,
    queue: String,
    options: ProcessorOptions,
}

impl Processor {
    pub(crate) fn new(client: Arc<ClientInner>, queue: &str, options: ProcessorOptions) -> Self {
        Self {
            client,
            queue: queue.to_string(),
            options,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Open the subscription and spawn the receive loop.
    pub async fn start<H: MessageHandler>(self, handler: H) -> Result<ProcessorHandle> {
        self.client.ensure_open()?;

        let prefetch = self.options.effective_prefetch();
        let subscription = self.client.transport.subscribe(&self.queue, prefetch).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let entity_path: Arc<str> = Arc::from(self.queue.as_str());
        let max_concurrent_calls = self.options.max_concurrent_calls.max(1);

        info!(
            queue = %self.queue,
            max_concurrent_calls = max_concurrent_calls,
            prefetch_count = prefetch,
            "processor_started"
        );

        let task = tokio::spawn(async move {
            receive_loop(
                subscription,
                Arc::new(handler),
                entity_path,
                max_concurrent_calls,
                stop_rx,
            )
            .await;
            let _ = done_tx.send(true);
        });

        Ok(ProcessorHandle {
            queue: self.queue,
            stop_tx,
            done_rx,
            task: Some(task),
        })
    }
}

/// Stop handle of a running processor.
///
/// Dropping the handle signals the loop to stop without waiting for it.
pub struct ProcessorHandle {
    queue: String,
    stop_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    task: Option<JoinHandle<()>>,
}

impl ProcessorHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Resolves once the receive loop has ended, whether through `stop()` or
    /// because the subscription closed underneath it.
    pub async fn stopped(&self) {
        let mut done = self.done_rx.clone();
        // A dropped sender means the loop task is gone as well
        let _ = done.wait_for(|done| *done).await;
    }

    /// Stop receiving and wait for in-flight callbacks. Calling it again is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        info!(queue = %self.queue, "processor_stopping");

        // Fails only when the loop already ended on its own
        let _ = self.stop_tx.send(true);
        task.await?;

        info!(queue = %self.queue, "processor_stopped");
        Ok(())
    }
}

impl Drop for ProcessorHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.stop_tx.send(true);
        }
    }
}

async fn receive_loop<H: MessageHandler>(
    mut subscription: Box<dyn Subscription>,
    handler: Arc<H>,
    entity_path: Arc<str>,
    max_concurrent_calls: usize,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        if in_flight.len() >= max_concurrent_calls {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                Some(joined) = in_flight.join_next() => {
                    log_join(joined);
                    continue;
                }
            }
        }

        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_join(joined);
            }
            next = subscription.next_message() => match next {
                Some(Ok(message)) => {
                    debug!(
                        queue = %entity_path,
                        message_id = message.message_id().unwrap_or("unknown"),
                        lock_token = message.lock_token(),
                        delivery_count = message.delivery_count(),
                        "processor_message_received"
                    );
                    in_flight.spawn(dispatch(Arc::clone(&handler), Arc::clone(&entity_path), message));
                }
                Some(Err(error)) => {
                    error!(queue = %entity_path, error = %error, "processor_receive_error");
                    handler
                        .process_error(ProcessErrorArgs {
                            error,
                            source: ErrorSource::Receive,
                            entity_path: entity_path.to_string(),
                            lock_token: None,
                        })
                        .await;
                }
                None => {
                    warn!(queue = %entity_path, "processor_subscription_ended");
                    handler
                        .process_error(ProcessErrorArgs {
                            error: QueueError::Closed("subscription"),
                            source: ErrorSource::Receive,
                            entity_path: entity_path.to_string(),
                            lock_token: None,
                        })
                        .await;
                    break;
                }
            }
        }
    }

    let draining = in_flight.len();
    if draining > 0 {
        debug!(queue = %entity_path, in_flight = draining, "processor_draining");
    }
    while let Some(joined) = in_flight.join_next().await {
        log_join(joined);
    }

    if let Err(e) = subscription.close().await {
        warn!(queue = %entity_path, error = %e, "processor_subscription_close_error");
    }
}

async fn dispatch<H: MessageHandler>(handler: Arc<H>, entity_path: Arc<str>, message: ReceivedMessage) {
    let lock_token = message.lock_token();
    let args = ProcessMessageArgs {
        message,
        entity_path,
    };

    let Err(error) = handler.process_message(&args).await else {
        if !args.message.is_settled() {
            debug!(
                queue = %args.entity_path,
                lock_token = lock_token,
                "processor_message_left_locked"
            );
        }
        return;
    };

    warn!(
        queue = %args.entity_path,
        lock_token = lock_token,
        error = %error,
        "processor_handler_failed"
    );

    handler
        .process_error(ProcessErrorArgs {
            error: QueueError::Handler(error),
            source: ErrorSource::UserCallback,
            entity_path: args.entity_path.to_string(),
            lock_token: Some(lock_token),
        })
        .await;

    if args.message.is_settled() {
        return;
    }

    if let Err(error) = args.message.abandon().await {
        handler
            .process_error(ProcessErrorArgs {
                error,
                source: ErrorSource::Abandon,
                entity_path: args.entity_path.to_string(),
                lock_token: Some(lock_token),
            })
            .await;
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "processor_callback_panicked");
    }
}
