//! Error types shared by the queue client, sender and processor.

use thiserror::Error;

/// Boxed error returned by user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Error originating from the AMQP client.
    #[error("AMQP communication error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The connection string is not a usable broker URI.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// A message did not fit into the batch being built.
    #[error("message {message_number} could not be added to the batch ({size_bytes} of {max_size_bytes} bytes used)")]
    BatchOverflow {
        message_number: usize,
        size_bytes: usize,
        max_size_bytes: usize,
    },

    /// The client, sender or processor was used after being closed.
    #[error("{0} has been closed")]
    Closed(&'static str),

    /// The transport refused a batch; nothing from it was enqueued.
    #[error("batch for queue '{queue}' was rejected: {reason}")]
    Rejected { queue: String, reason: String },

    /// The message was already completed or abandoned.
    #[error("message with lock token {0} has already been settled")]
    AlreadySettled(u64),

    /// The message handler returned an error.
    #[error("message handler failed: {0}")]
    Handler(#[source] BoxError),

    /// The background receive loop panicked or was aborted.
    #[error("processor task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
