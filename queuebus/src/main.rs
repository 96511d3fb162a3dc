//! QueueBus Processor - receives messages from the queue until stopped.
//!
//! Each message body is printed and the message is completed. The processor
//! stops on SIGINT/SIGTERM, waits for in-flight messages and closes the
//! connection.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use queuebus::consume::{self, PrintingHandler};
use queuebus::{shutdown_signal, Config, ProcessorOptions, QueueClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("processor_starting");

    // Configuration errors are fatal before any connection attempt
    let config = Config::load().context("Failed to load configuration")?;
    let options = ProcessorOptions::from(&config);
    tracing::info!(
        queue = %config.queue_name,
        max_concurrent_calls = options.max_concurrent_calls,
        prefetch_count = options.prefetch_count,
        "config_loaded"
    );

    let client = QueueClient::connect(&config.connection_string)
        .await
        .context("Failed to connect to queue broker")?;

    println!("Processing messages from '{}'. Press Ctrl+C to stop.", config.queue_name);

    consume::run(client, &config.queue_name, options, PrintingHandler, shutdown_signal())
        .await
        .context("Processor failed")?;

    println!("Stopped receiving messages.");
    Ok(())
}
