//! In-process transport.
//!
//! Keeps queues in memory with the same delivery semantics the processor
//! relies on from a broker: messages stay locked until completed, abandoned
//! messages come back with a higher delivery count, and a closed subscription
//! hands its unsettled messages back. The most recent submitted batches and
//! completed messages are kept so callers can inspect what went through.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::transport::{Subscription, Transport};
use super::types::{OutgoingMessage, ReceivedMessage, Settlement};
use crate::error::{QueueError, Result};

/// How many batches and completed messages are kept for inspection.
pub const HISTORY_LIMIT: usize = 1024;

/// Append to a bounded history, dropping the oldest entry when full.
fn record<T>(history: &mut VecDeque<T>, item: T) {
    if history.len() == HISTORY_LIMIT {
        history.pop_front();
    }
    history.push_back(item);
}

#[derive(Debug, Clone)]
struct Stored {
    message: OutgoingMessage,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    /// lock token -> (owning subscription, message)
    locked: HashMap<u64, (u64, Stored)>,
    completed: VecDeque<OutgoingMessage>,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    batches: Mutex<VecDeque<(String, Vec<OutgoingMessage>)>>,
    notify: Notify,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    #[cfg(test)]
    fail_sends: AtomicBool,
    next_token: AtomicU64,
    next_subscription: AtomicU64,
}

impl Shared {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> R) -> R {
        let mut queues = self.queues();
        f(queues.entry(queue.to_string()).or_default())
    }

    fn settle(&self, queue: &str, token: u64, complete: bool) -> Result<()> {
        let settled = self.with_queue(queue, |state| {
            let (_, stored) = state.locked.remove(&token)?;
            if complete {
                record(&mut state.completed, stored.message);
            } else {
                state.ready.push_front(Stored {
                    delivery_count: stored.delivery_count + 1,
                    ..stored
                });
            }
            Some(())
        });

        match settled {
            Some(()) => {
                if !complete {
                    self.notify.notify_waiters();
                }
                Ok(())
            }
            None => Err(QueueError::AlreadySettled(token)),
        }
    }

    /// Put every message still locked by `subscription` back at the head of the queue.
    fn release(&self, queue: &str, subscription: u64) -> usize {
        let released = self.with_queue(queue, |state| {
            let mut tokens: Vec<u64> = state
                .locked
                .iter()
                .filter(|(_, (owner, _))| *owner == subscription)
                .map(|(token, _)| *token)
                .collect();
            // Newest first, so after the pushes the oldest is back at the head
            tokens.sort_unstable_by(|a, b| b.cmp(a));

            for token in &tokens {
                if let Some((_, stored)) = state.locked.remove(token) {
                    state.ready.push_front(Stored {
                        delivery_count: stored.delivery_count + 1,
                        ..stored
                    });
                }
            }
            tokens.len()
        });

        if released > 0 {
            self.notify.notify_waiters();
        }
        released
    }
}

/// Queue transport living entirely inside the current process.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `send_batch` fail (or succeed again).
    #[cfg(test)]
    pub(crate) fn fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// The last [`HISTORY_LIMIT`] accepted batches, in submission order.
    pub fn sent_batches(&self) -> Vec<(String, Vec<OutgoingMessage>)> {
        self.shared
            .batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Messages waiting to be delivered.
    pub fn ready(&self, queue: &str) -> Vec<OutgoingMessage> {
        self.shared
            .with_queue(queue, |s| s.ready.iter().map(|m| m.message.clone()).collect())
    }

    /// Delivery counts of the waiting messages, in queue order.
    pub fn ready_delivery_counts(&self, queue: &str) -> Vec<u32> {
        self.shared
            .with_queue(queue, |s| s.ready.iter().map(|m| m.delivery_count).collect())
    }

    /// Number of messages delivered but not yet settled.
    pub fn locked_count(&self, queue: &str) -> usize {
        self.shared.with_queue(queue, |s| s.locked.len())
    }

    /// The last [`HISTORY_LIMIT`] completed messages, in completion order.
    pub fn completed(&self, queue: &str) -> Vec<OutgoingMessage> {
        self.shared
            .with_queue(queue, |s| s.completed.iter().cloned().collect())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// How many times `close` reached the transport.
    pub fn close_calls(&self) -> usize {
        self.shared.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send_batch(&self, queue: &str, messages: Vec<OutgoingMessage>) -> Result<()> {
        if self.is_closed() {
            return Err(QueueError::Closed("memory transport"));
        }
        #[cfg(test)]
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(QueueError::Rejected {
                queue: queue.to_string(),
                reason: "sends are set to fail".to_string(),
            });
        }

        self.shared.with_queue(queue, |state| {
            state.ready.extend(messages.iter().cloned().map(|message| Stored {
                message,
                delivery_count: 1,
            }));
        });
        record(
            &mut self.shared.batches.lock().unwrap_or_else(PoisonError::into_inner),
            (queue.to_string(), messages),
        );
        self.shared.notify.notify_waiters();

        debug!(queue = queue, "memory_batch_enqueued");
        Ok(())
    }

    async fn subscribe(&self, queue: &str, _prefetch: u16) -> Result<Box<dyn Subscription>> {
        if self.is_closed() {
            return Err(QueueError::Closed("memory transport"));
        }

        let id = self.shared.next_subscription.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            id,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    queue: String,
    id: u64,
}

impl MemorySubscription {
    fn try_take(&self) -> Option<ReceivedMessage> {
        let (token, stored) = self.shared.with_queue(&self.queue, |state| {
            let stored = state.ready.pop_front()?;
            let token = self.shared.next_token.fetch_add(1, Ordering::SeqCst);
            state.locked.insert(token, (self.id, stored.clone()));
            Some((token, stored))
        })?;

        Some(ReceivedMessage::new(
            stored.message.body,
            stored.message.message_id,
            stored.delivery_count,
            token,
            Box::new(MemorySettlement {
                shared: Arc::clone(&self.shared),
                queue: self.queue.clone(),
                token,
            }),
        ))
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Option<Result<ReceivedMessage>> {
        loop {
            // Register interest before checking so a concurrent push is not missed
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(message) = self.try_take() {
                return Some(Ok(message));
            }

            notified.await;
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        // Release happens in Drop
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let released = self.shared.release(&self.queue, self.id);
        if released > 0 {
            debug!(queue = %self.queue, released = released, "memory_subscription_released");
        }
    }
}

struct MemorySettlement {
    shared: Arc<Shared>,
    queue: String,
    token: u64,
}

#[async_trait]
impl Settlement for MemorySettlement {
    async fn complete(&self) -> Result<()> {
        self.shared.settle(&self.queue, self.token, true)
    }

    async fn abandon(&self) -> Result<()> {
        self.shared.settle(&self.queue, self.token, false)
    }
}
