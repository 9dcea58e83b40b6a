use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use super::{BusMessage, MessageBus, Topic};
use crate::error::BusError;

/// Reference [`MessageBus`] implementation: per-subscriber bounded
/// `tokio::mpsc` queues, tracked in a `RwLock<HashMap<...>>` the same way
/// `KafkaEventBus` tracks its active consumers for shutdown coordination.
#[derive(Debug)]
pub struct InMemoryMessageBus {
    subscribers: RwLock<HashMap<(Topic, String), mpsc::Sender<BusMessage>>>,
    /// How long `publish` waits for room in a full subscriber queue before
    /// giving up and returning [`BusError::QueueFull`].
    send_timeout: Duration,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            send_timeout: Duration::from_millis(250),
        }
    }

    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            send_timeout,
        }
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn subscribe(
        &self,
        topic: Topic,
        consumer_id: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert((topic, consumer_id.to_string()), tx);
        debug!(topic = topic.as_str(), consumer_id, "subscribed to bus topic");
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: Topic, consumer_id: &str) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.remove(&(topic, consumer_id.to_string()));
        debug!(topic = topic.as_str(), consumer_id, "unsubscribed from bus topic");
    }

    async fn publish(&self, topic: Topic, message: BusMessage) -> Result<(), BusError> {
        let subscribers = self.subscribers.read().await;
        let targets: Vec<_> = subscribers
            .iter()
            .filter(|((t, _), _)| *t == topic)
            .map(|(_, tx)| tx.clone())
            .collect();
        drop(subscribers);

        for tx in targets {
            match tokio::time::timeout(self.send_timeout, tx.send(message.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    // Subscriber dropped its receiver; nothing to retry against.
                    warn!(topic = topic.as_str(), "subscriber receiver closed, dropping message for it");
                }
                Err(_) => {
                    warn!(topic = topic.as_str(), "subscriber queue full after timeout");
                    return Err(BusError::QueueFull { topic: topic.as_str() });
                }
            }
        }
        Ok(())
    }
}
