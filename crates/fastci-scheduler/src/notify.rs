//! In-process change notifier.

use async_trait::async_trait;
use fastci_core::Result;
use fastci_core::ports::ChangeNotifier;
use tokio::sync::broadcast;
use tracing::debug;

/// Fans topic names out to local subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<String>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl ChangeNotifier for BroadcastNotifier {
    async fn publish(&self, topic: &str) -> Result<()> {
        // Nobody listening is not a failure.
        match self.sender.send(topic.to_string()) {
            Ok(receivers) => debug!(topic, receivers, "Published change notification"),
            Err(_) => debug!(topic, "No subscribers for change notification"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_topic() {
        let notifier = BroadcastNotifier::default();
        let mut rx = notifier.subscribe();

        notifier.publish("pipeline-job-state-change").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "pipeline-job-state-change");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let notifier = BroadcastNotifier::default();
        assert!(notifier.publish("topic").await.is_ok());
    }
}
