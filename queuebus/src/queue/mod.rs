//! Queue module.
//!
//! This module provides:
//! - Message and batch types
//! - A client owning the broker connection, with senders and processors
//! - Two transports: AMQP over lapin and an in-process one
//!
//! ## Flow
//!
//! ```text
//! QueueClient ─┬─ Sender ──── MessageBatch ──→ queue
//!              └─ Processor ← subscription ←── queue
//!                    └─ MessageHandler::{process_message, process_error}
//! ```

pub mod amqp;
pub mod batch;
pub mod client;
pub mod connection;
pub mod memory;
pub mod processor;
pub mod transport;
pub mod types;

pub use amqp::AmqpTransport;
pub use batch::MessageBatch;
pub use client::{QueueClient, Sender};
pub use connection::ConnectionString;
pub use memory::MemoryTransport;
pub use processor::{
    ErrorSource, MessageHandler, ProcessErrorArgs, ProcessMessageArgs, Processor, ProcessorHandle,
    ProcessorOptions,
};
pub use transport::{Subscription, Transport};
pub use types::{OutgoingMessage, ReceivedMessage, Settlement};
