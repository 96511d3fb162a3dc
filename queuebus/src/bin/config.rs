//! QueueBus Config - prints the resolved connection string.
//!
//! Merges `appsettings.json`, `appsettings.{QUEUEBUS_ENVIRONMENT}.json` and
//! the process environment, then prints the primary connection string.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use queuebus::{Configuration, ConnectionStrings};

fn main() -> Result<()> {
    // Logs go to stderr so stdout only carries the resolved value
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true).with_writer(std::io::stderr))
        .init();

    let configuration = Configuration::load().context("Failed to load configuration")?;
    let connection_strings = ConnectionStrings::from_configuration(&configuration)
        .context("Failed to read connection strings")?;
    let primary = connection_strings
        .primary()
        .context("Failed to read primary connection string")?;

    info!(connection_string_length = primary.len(), "config_resolved");

    println!("connectionStrings.ServiceBus.PrimaryConnectionString = {primary}\n");
    Ok(())
}
