//! QueueBus - queue publisher and background processor.
//!
//! This library provides shared modules for the three QueueBus binaries:
//! - `queuebus-send`: publishes a batch of text messages
//! - `queuebus-processor`: receives, prints and completes messages until stopped
//! - `queuebus-config`: prints the resolved connection string
//!
//! ## Architecture
//!
//! ```text
//! appsettings.json + appsettings.{env}.json + env vars → Config
//! Config → QueueClient → Sender → batch → queue → Processor → MessageHandler
//! ```

pub mod config;
pub mod consume;
pub mod error;
pub mod publish;
pub mod queue;
pub mod shutdown;

// Re-export commonly used types
pub use config::{Config, ConfigError, Configuration, ConnectionStrings};
pub use error::{BoxError, QueueError};
pub use queue::{
    MessageHandler, OutgoingMessage, ProcessErrorArgs, ProcessMessageArgs, ProcessorOptions,
    QueueClient,
};
pub use shutdown::shutdown_signal;
