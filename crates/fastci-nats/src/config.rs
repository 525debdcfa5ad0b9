//! Configuration for the NATS notifier.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection settings for the NATS notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URLs (several for a cluster).
    pub urls: Vec<String>,
    /// Maximum reconnection attempts; `None` retries forever.
    #[serde(default)]
    pub max_reconnect_attempts: Option<usize>,
    #[serde(default = "default_connection_timeout", with = "secs")]
    pub connection_timeout: Duration,
    #[serde(default = "default_request_timeout", with = "secs")]
    pub request_timeout: Duration,
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_string()],
            max_reconnect_attempts: None,
            connection_timeout: default_connection_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl NatsConfig {
    /// Create a new config with a single URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    /// Set multiple server URLs for cluster support.
    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }

    /// Set max reconnection attempts.
    pub fn with_max_reconnects(mut self, max: usize) -> Self {
        self.max_reconnect_attempts = Some(max);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = NatsConfig::new("nats://a:4222")
            .with_urls(vec!["nats://a:4222".into(), "nats://b:4222".into()])
            .with_max_reconnects(3);
        assert_eq!(config.urls.len(), 2);
        assert_eq!(config.max_reconnect_attempts, Some(3));
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
    }
}
