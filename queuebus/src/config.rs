//! Layered configuration loading.
//!
//! Configuration is merged from up to three sources, later sources winning:
//!
//! 1. `appsettings.json` (required)
//! 2. `appsettings.{environment}.json` (optional, environment from `QUEUEBUS_ENVIRONMENT`)
//! 3. process environment variables, with `__` separating sections
//!    (`ConnectionStrings__ServiceBus__PrimaryConnectionString`)
//!
//! Keys are case-insensitive. The merged tree is loaded once and then handed
//! around as an immutable [`Config`].

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use ::config::{Environment, File, FileFormat, Map};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable naming the active environment (`Development`, `Production`, ...).
pub const ENVIRONMENT_VAR: &str = "QUEUEBUS_ENVIRONMENT";

/// Environment variable pointing at the directory holding `appsettings*.json`.
pub const CONFIG_DIR_VAR: &str = "QUEUEBUS_CONFIG_DIR";

/// Base configuration file name.
pub const BASE_FILE: &str = "appsettings.json";

/// Separator used by environment variables to address nested keys.
const ENV_SECTION_SEPARATOR: &str = "__";

/// Section holding the broker connection strings.
pub const CONNECTION_STRINGS_SECTION: &str = "ConnectionStrings";

/// Default queue name.
pub const DEFAULT_QUEUE_NAME: &str = "az204-queue";

/// Default number of messages the publisher puts in its batch.
pub const DEFAULT_MESSAGE_COUNT: usize = 3;

/// Default batch size limit (256 KiB, the standard tier message limit).
pub const DEFAULT_MAX_BATCH_SIZE_BYTES: usize = 256 * 1024;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("missing required configuration section '{0}'")]
    MissingSection(String),

    #[error("invalid value in configuration section '{section}': {source}")]
    Invalid {
        section: String,
        #[source]
        source: ::config::ConfigError,
    },
}

/// Merged, read-only configuration tree.
#[derive(Debug, Clone)]
pub struct Configuration {
    inner: ::config::Config,
}

impl Configuration {
    /// Load `appsettings.json`, the environment override and the given variables from `dir`.
    pub fn load_layered<I, K, V>(
        dir: &Path,
        environment: Option<&str>,
        vars: I,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut builder = ::config::Config::builder().add_source(
            File::from(dir.join(BASE_FILE))
                .format(FileFormat::Json)
                .required(true),
        );

        if let Some(environment) = environment.filter(|e| !e.is_empty()) {
            let override_file = dir.join(format!("appsettings.{environment}.json"));
            debug!(path = %override_file.display(), "config_environment_file");
            builder = builder.add_source(
                File::from(override_file)
                    .format(FileFormat::Json)
                    .required(false),
            );
        }

        let vars: Map<String, String> = vars
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();

        let inner = builder
            .add_source(
                Environment::default()
                    .separator(ENV_SECTION_SEPARATOR)
                    .try_parsing(true)
                    .source(Some(vars)),
            )
            .build()?;

        Ok(Self { inner })
    }

    /// Load from `QUEUEBUS_CONFIG_DIR` (default: current directory) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let dir = env::var(CONFIG_DIR_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let environment = env::var(ENVIRONMENT_VAR).ok();

        info!(
            config_dir = %dir.display(),
            environment = environment.as_deref().unwrap_or(""),
            "config_loading"
        );

        Self::load_layered(&dir, environment.as_deref(), env::vars())
    }

    /// Look up a value by a `:`-separated, case-insensitive key.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        let path = key.replace(':', ".").to_ascii_lowercase();

        match self.inner.get::<T>(&path) {
            Ok(value) => Ok(Some(value)),
            Err(::config::ConfigError::NotFound(_)) => Ok(None),
            Err(source) => Err(ConfigError::Invalid {
                section: key.to_string(),
                source,
            }),
        }
    }

    /// Deserialize a section that must exist.
    pub fn required_section<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        self.get(key)?
            .ok_or_else(|| ConfigError::MissingSection(key.to_string()))
    }

    /// Deserialize a section, falling back to its default when absent.
    pub fn section_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, ConfigError> {
        Ok(self.get(key)?.unwrap_or_default())
    }
}

/// `ConnectionStrings` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionStrings {
    #[serde(default, rename = "servicebus")]
    pub service_bus: Option<ServiceBus>,
}

/// `ConnectionStrings:ServiceBus` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceBus {
    #[serde(default, rename = "primaryconnectionstring")]
    pub primary_connection_string: Option<String>,
}

impl ConnectionStrings {
    /// Read the required `ConnectionStrings` section from the merged configuration.
    pub fn from_configuration(configuration: &Configuration) -> Result<Self, ConfigError> {
        configuration.required_section(CONNECTION_STRINGS_SECTION)
    }

    /// The primary broker connection string. Empty values count as missing.
    pub fn primary(&self) -> Result<&str, ConfigError> {
        let service_bus = self.service_bus.as_ref().ok_or_else(|| {
            ConfigError::MissingSection(format!("{CONNECTION_STRINGS_SECTION}:ServiceBus"))
        })?;

        service_bus
            .primary_connection_string
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                ConfigError::MissingSection(format!(
                    "{CONNECTION_STRINGS_SECTION}:ServiceBus:PrimaryConnectionString"
                ))
            })
    }
}

/// `Queue` section.
#[derive(Debug, Clone, Deserialize)]
struct QueueSection {
    #[serde(default = "default_queue_name")]
    name: String,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
        }
    }
}

/// `Publisher` section.
#[derive(Debug, Clone, Deserialize)]
struct PublisherSection {
    #[serde(default = "default_message_count", rename = "messagecount")]
    message_count: usize,

    #[serde(default = "default_max_batch_size", rename = "maxbatchsizebytes")]
    max_batch_size_bytes: usize,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            message_count: default_message_count(),
            max_batch_size_bytes: default_max_batch_size(),
        }
    }
}

/// `Processor` section.
#[derive(Debug, Clone, Deserialize)]
struct ProcessorSection {
    #[serde(default = "default_max_concurrent_calls", rename = "maxconcurrentcalls")]
    max_concurrent_calls: usize,

    #[serde(default, rename = "prefetchcount")]
    prefetch_count: u16,
}

impl Default for ProcessorSection {
    fn default() -> Self {
        Self {
            max_concurrent_calls: default_max_concurrent_calls(),
            prefetch_count: 0,
        }
    }
}

fn default_queue_name() -> String {
    DEFAULT_QUEUE_NAME.to_string()
}

fn default_message_count() -> usize {
    DEFAULT_MESSAGE_COUNT
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE_BYTES
}

fn default_max_concurrent_calls() -> usize {
    1
}

/// Resolved application configuration.
#[derive(Clone)]
pub struct Config {
    /// Broker connection string (sensitive)
    pub connection_string: String,

    /// Queue to publish to and consume from
    pub queue_name: String,

    /// Number of messages the publisher batches
    pub message_count: usize,

    /// Maximum batch size in bytes
    pub max_batch_size_bytes: usize,

    /// Maximum number of message callbacks running at once
    pub max_concurrent_calls: usize,

    /// Broker prefetch; 0 means "same as max_concurrent_calls"
    pub prefetch_count: u16,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("connection_string", &"<redacted>")
            .field("queue_name", &self.queue_name)
            .field("message_count", &self.message_count)
            .field("max_batch_size_bytes", &self.max_batch_size_bytes)
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .field("prefetch_count", &self.prefetch_count)
            .finish()
    }
}

impl Config {
    /// Load and resolve configuration from disk and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_configuration(&Configuration::load()?)
    }

    pub fn from_configuration(configuration: &Configuration) -> Result<Self, ConfigError> {
        let connection_strings = ConnectionStrings::from_configuration(configuration)?;
        let queue: QueueSection = configuration.section_or_default("Queue")?;
        let publisher: PublisherSection = configuration.section_or_default("Publisher")?;
        let processor: ProcessorSection = configuration.section_or_default("Processor")?;

        Ok(Config {
            connection_string: connection_strings.primary()?.to_string(),
            queue_name: queue.name,
            message_count: publisher.message_count,
            max_batch_size_bytes: publisher.max_batch_size_bytes,
            max_concurrent_calls: processor.max_concurrent_calls.max(1),
            prefetch_count: processor.prefetch_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const PRIMARY_KEY: &str = "ConnectionStrings__ServiceBus__PrimaryConnectionString";

    fn write(dir: &TempDir, name: &str, body: &str) {
        fs::write(dir.path().join(name), body).unwrap();
    }

    fn base_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            BASE_FILE,
            r#"{"ConnectionStrings":{"ServiceBus":{"PrimaryConnectionString":"amqp://base"}}}"#,
        );
        write(
            &dir,
            "appsettings.Development.json",
            r#"{"ConnectionStrings":{"ServiceBus":{"PrimaryConnectionString":"amqp://dev"}}}"#,
        );
        dir
    }

    fn no_vars() -> Vec<(String, String)> {
        Vec::new()
    }

    #[test]
    fn test_base_file_only() {
        let dir = base_dir();
        let cfg = Configuration::load_layered(dir.path(), None, no_vars()).unwrap();
        let config = Config::from_configuration(&cfg).unwrap();
        assert_eq!(config.connection_string, "amqp://base");
    }

    #[test]
    fn test_environment_file_overrides_base() {
        let dir = base_dir();
        let cfg = Configuration::load_layered(dir.path(), Some("Development"), no_vars()).unwrap();
        let config = Config::from_configuration(&cfg).unwrap();
        assert_eq!(config.connection_string, "amqp://dev");
    }

    #[test]
    fn test_environment_variable_overrides_files() {
        let dir = base_dir();
        let vars = vec![(PRIMARY_KEY, "amqp://env")];
        let cfg = Configuration::load_layered(dir.path(), Some("Development"), vars).unwrap();
        let config = Config::from_configuration(&cfg).unwrap();
        assert_eq!(config.connection_string, "amqp://env");
    }

    #[test]
    fn test_missing_environment_file_is_optional() {
        let dir = base_dir();
        let cfg = Configuration::load_layered(dir.path(), Some("Staging"), no_vars()).unwrap();
        let config = Config::from_configuration(&cfg).unwrap();
        assert_eq!(config.connection_string, "amqp://base");
    }

    #[test]
    fn test_missing_base_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = Configuration::load_layered(dir.path(), None, no_vars()).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_invalid_json_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        write(&dir, BASE_FILE, "{ not json");
        let err = Configuration::load_layered(dir.path(), None, no_vars()).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_missing_connection_strings_section() {
        let dir = TempDir::new().unwrap();
        write(&dir, BASE_FILE, r#"{"Logging":{"Level":"Debug"}}"#);
        let cfg = Configuration::load_layered(dir.path(), None, no_vars()).unwrap();
        let err = Config::from_configuration(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection(ref s) if s == "ConnectionStrings"));
    }

    #[test]
    fn test_missing_primary_connection_string() {
        let dir = TempDir::new().unwrap();
        write(&dir, BASE_FILE, r#"{"ConnectionStrings":{"ServiceBus":{}}}"#);
        let cfg = Configuration::load_layered(dir.path(), None, no_vars()).unwrap();
        let err = Config::from_configuration(&cfg).unwrap_err();
        assert!(
            matches!(err, ConfigError::MissingSection(ref s) if s.ends_with("PrimaryConnectionString"))
        );
    }

    #[test]
    fn test_empty_connection_string_counts_as_missing() {
        let dir = base_dir();
        let vars = vec![(PRIMARY_KEY, "  ")];
        let cfg = Configuration::load_layered(dir.path(), None, vars).unwrap();
        assert!(matches!(
            Config::from_configuration(&cfg),
            Err(ConfigError::MissingSection(_))
        ));
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            BASE_FILE,
            r#"{"connectionStrings":{"serviceBus":{"primaryConnectionString":"amqp://lower"}}}"#,
        );
        let cfg = Configuration::load_layered(dir.path(), None, no_vars()).unwrap();
        assert_eq!(
            cfg.get::<String>("ConnectionStrings:ServiceBus:PrimaryConnectionString")
                .unwrap()
                .as_deref(),
            Some("amqp://lower")
        );

        let vars = vec![("CONNECTIONSTRINGS__SERVICEBUS__PRIMARYCONNECTIONSTRING", "amqp://upper")];
        let cfg = Configuration::load_layered(dir.path(), None, vars).unwrap();
        let config = Config::from_configuration(&cfg).unwrap();
        assert_eq!(config.connection_string, "amqp://upper");
    }

    #[test]
    fn test_optional_sections_use_defaults() {
        let dir = base_dir();
        let cfg = Configuration::load_layered(dir.path(), None, no_vars()).unwrap();
        let config = Config::from_configuration(&cfg).unwrap();
        assert_eq!(config.queue_name, DEFAULT_QUEUE_NAME);
        assert_eq!(config.message_count, DEFAULT_MESSAGE_COUNT);
        assert_eq!(config.max_batch_size_bytes, DEFAULT_MAX_BATCH_SIZE_BYTES);
        assert_eq!(config.max_concurrent_calls, 1);
        assert_eq!(config.prefetch_count, 0);
    }

    #[test]
    fn test_numeric_values_from_strings_and_numbers() {
        let dir = base_dir();
        write(
            &dir,
            "appsettings.Production.json",
            r#"{"Publisher":{"MessageCount":10},"Queue":{"Name":"orders"}}"#,
        );
        let vars = vec![("Processor__MaxConcurrentCalls", "4"), ("Processor__PrefetchCount", "16")];
        let cfg = Configuration::load_layered(dir.path(), Some("Production"), vars).unwrap();
        let config = Config::from_configuration(&cfg).unwrap();
        assert_eq!(config.queue_name, "orders");
        assert_eq!(config.message_count, 10);
        assert_eq!(config.max_concurrent_calls, 4);
        assert_eq!(config.prefetch_count, 16);
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let dir = base_dir();
        let vars = vec![("Publisher__MessageCount", "many")];
        let cfg = Configuration::load_layered(dir.path(), None, vars).unwrap();
        let err = Config::from_configuration(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref section, .. } if section == "Publisher"));
    }

    #[test]
    fn test_environment_variable_keeps_sibling_keys() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            BASE_FILE,
            r#"{"ConnectionStrings":{"ServiceBus":{"PrimaryConnectionString":"amqp://base"}},
                "Publisher":{"MessageCount":7,"MaxBatchSizeBytes":2048}}"#,
        );
        let vars = vec![("PUBLISHER__MESSAGECOUNT", "9")];
        let cfg = Configuration::load_layered(dir.path(), None, vars).unwrap();
        let config = Config::from_configuration(&cfg).unwrap();
        assert_eq!(config.message_count, 9);
        assert_eq!(config.max_batch_size_bytes, 2048);
    }

    #[test]
    fn test_missing_key_is_none() {
        let dir = base_dir();
        let cfg = Configuration::load_layered(dir.path(), None, no_vars()).unwrap();
        assert!(cfg.get::<String>("Queue:Name").unwrap().is_none());
        assert!(matches!(
            cfg.required_section::<String>("Queue:Name"),
            Err(ConfigError::MissingSection(ref s)) if s == "Queue:Name"
        ));
    }

    #[test]
    fn test_debug_redacts_connection_string() {
        let dir = base_dir();
        let cfg = Configuration::load_layered(dir.path(), None, no_vars()).unwrap();
        let config = Config::from_configuration(&cfg).unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("amqp://base"));
        assert!(printed.contains("<redacted>"));
    }
}
