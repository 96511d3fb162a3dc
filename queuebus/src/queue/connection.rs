//! Broker connection string parsing.

use std::fmt;

use url::Url;

use crate::error::{QueueError, Result};

/// A validated `amqp://` or `amqps://` connection string.
///
/// The raw value is a credential: `Display` and `Debug` only ever show the
/// redacted form.
#[derive(Clone)]
pub struct ConnectionString {
    raw: String,
    url: Url,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let url = Url::parse(raw)
            .map_err(|e| QueueError::InvalidConnectionString(format!("not a valid URI: {e}")))?;

        match url.scheme() {
            "amqp" | "amqps" => {}
            other => {
                return Err(QueueError::InvalidConnectionString(format!(
                    "unsupported scheme '{other}', expected amqp or amqps"
                )))
            }
        }

        if url.host_str().map_or(true, str::is_empty) {
            return Err(QueueError::InvalidConnectionString(
                "missing broker host".to_string(),
            ));
        }

        Ok(Self {
            raw: raw.to_string(),
            url,
        })
    }

    /// The original string, credentials included.
    pub fn expose(&self) -> &str {
        &self.raw
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "amqps"
    }

    /// The URI with its password replaced by `***`.
    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        if url.password().is_some() {
            // Only fails for cannot-be-a-base URLs, which parse() already rejected
            let _ = url.set_password(Some("***"));
        }
        url.to_string()
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionString").field(&self.redacted()).finish()
    }
}
