//! Change notifier publishing to a NATS subject.

use crate::config::NatsConfig;
use async_trait::async_trait;
use fastci_core::ports::ChangeNotifier;
use fastci_core::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Publishes an empty message on the topic subject for every notification.
#[derive(Clone)]
pub struct NatsNotifier {
    client: async_nats::Client,
    published: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl NatsNotifier {
    /// Connect to a single NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(NatsConfig::new(url)).await
    }

    /// Connect with custom configuration.
    pub async fn connect_with_config(config: NatsConfig) -> Result<Self> {
        let urls = config.urls.join(",");
        info!(urls = %urls, "Connecting to NATS");

        let mut options = async_nats::ConnectOptions::new()
            .connection_timeout(config.connection_timeout)
            .request_timeout(Some(config.request_timeout))
            .retry_on_initial_connect();
        if let Some(max) = config.max_reconnect_attempts {
            options = options.max_reconnects(max);
        }

        let client = options
            .connect(urls.as_str())
            .await
            .map_err(|e| Error::Notify(format!("Failed to connect to NATS: {e}")))?;

        info!("Connected to NATS");
        Ok(Self::with_client(client))
    }

    /// Wrap an existing client.
    pub fn with_client(client: async_nats::Client) -> Self {
        Self {
            client,
            published: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Notifications delivered to the server so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn failed(&self, message: String) -> Error {
        self.failures.fetch_add(1, Ordering::Relaxed);
        warn!(error = %message, "NATS publish failed");
        Error::Notify(message)
    }
}

#[async_trait]
impl ChangeNotifier for NatsNotifier {
    async fn publish(&self, topic: &str) -> Result<()> {
        self.client
            .publish(topic.to_string(), Default::default())
            .await
            .map_err(|e| self.failed(format!("Failed to publish to {topic}: {e}")))?;
        self.client
            .flush()
            .await
            .map_err(|e| self.failed(format!("Failed to flush NATS connection: {e}")))?;

        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(topic, "Published change notification");
        Ok(())
    }
}
