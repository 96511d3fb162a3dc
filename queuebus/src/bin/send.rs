//! QueueBus Send - publishes one batch of text messages.
//!
//! This binary:
//! 1. Loads the layered configuration
//! 2. Connects to the broker
//! 3. Publishes "Message 1".."Message N" as a single batch
//! 4. Closes the connection, whether or not the publish succeeded

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use queuebus::{publish, Config, QueueClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("sender_starting");

    let config = Config::load().context("Failed to load configuration")?;
    info!(
        queue = %config.queue_name,
        message_count = config.message_count,
        max_batch_size_bytes = config.max_batch_size_bytes,
        "config_loaded"
    );

    let client = QueueClient::connect(&config.connection_string)
        .await
        .context("Failed to connect to queue broker")?;

    let sent = publish::run(client, &config)
        .await
        .context("Failed to publish message batch")?;

    println!("A batch of {sent} messages has been published to the queue.");
    Ok(())
}
