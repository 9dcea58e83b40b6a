//! Production [`MessageBus`] backed by `rdkafka`, feature-gated behind
//! `kafka`. Ported from the teacher's `KafkaEventBus`: same producer/consumer
//! client settings, same shutdown-via-watch-channel coordination, adapted to
//! the keepalive core's two fixed topics instead of a generic `Event` type
//! parameter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Message;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use super::{BusMessage, MessageBus, Topic};
use crate::error::BusError;

#[derive(Debug, Clone)]
pub struct KafkaBusConfig {
    pub bootstrap_servers: String,
    pub timeout: Duration,
    pub consumer_group_prefix: String,
    pub security_protocol: String,
}

impl KafkaBusConfig {
    pub fn from_env() -> Result<Self, BusError> {
        dotenv::dotenv().ok();

        let bootstrap_servers = std::env::var("KEEPALIVED_KAFKA_BOOTSTRAP_SERVERS")
            .map_err(|_| BusError::Transport("KEEPALIVED_KAFKA_BOOTSTRAP_SERVERS must be set".into()))?;
        let consumer_group_prefix = std::env::var("KEEPALIVED_KAFKA_CONSUMER_GROUP")
            .unwrap_or_else(|_| "keepalived".to_string());
        let timeout_ms: u64 = std::env::var("KEEPALIVED_KAFKA_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .map_err(|_| BusError::Transport("KEEPALIVED_KAFKA_TIMEOUT_MS must be a valid number".into()))?;
        let security_protocol =
            std::env::var("KEEPALIVED_KAFKA_SECURITY_PROTOCOL").unwrap_or_else(|_| "PLAINTEXT".to_string());

        Ok(Self {
            bootstrap_servers,
            timeout: Duration::from_millis(timeout_ms),
            consumer_group_prefix,
            security_protocol,
        })
    }
}

pub struct KafkaMessageBus {
    producer: Arc<FutureProducer>,
    config: KafkaBusConfig,
    consumers: Arc<RwLock<HashMap<String, Arc<StreamConsumer>>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for KafkaMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaMessageBus")
            .field("bootstrap_servers", &self.config.bootstrap_servers)
            .finish()
    }
}

impl KafkaMessageBus {
    pub async fn new(config: KafkaBusConfig) -> Result<Self, BusError> {
        info!(brokers = %config.bootstrap_servers, "initializing kafka-backed message bus");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("security.protocol", &config.security_protocol)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("retries", "10")
            .set("retry.backoff.ms", "1000")
            .set("compression.type", "zstd")
            .set("linger.ms", "5")
            .create()
            .map_err(|e| BusError::Transport(format!("failed to create kafka producer: {e}")))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            producer: Arc::new(producer),
            config,
            consumers: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
            shutdown_rx,
        })
    }

    fn create_consumer(&self, consumer_group: &str) -> Result<StreamConsumer, BusError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("security.protocol", &self.config.security_protocol)
            .set("group.id", consumer_group)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .create()
            .map_err(|e| BusError::Transport(format!("failed to create kafka consumer: {e}")))
    }

    pub async fn shutdown(&self) {
        info!("shutting down kafka message bus");
        let _ = self.shutdown_tx.send(true);
        self.consumers.write().await.clear();
    }
}

#[async_trait]
impl MessageBus for KafkaMessageBus {
    async fn subscribe(
        &self,
        topic: Topic,
        consumer_id: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let consumer_group = format!("{}-{}", self.config.consumer_group_prefix, consumer_id);
        let consumer = Arc::new(self.create_consumer(&consumer_group)?);
        consumer.subscribe(&[topic.as_str()]).map_err(|e| BusError::SubscriptionFailed {
            topic: topic.as_str(),
            consumer_id: consumer_id.to_string(),
            reason: e.to_string(),
        })?;

        self.consumers.write().await.insert(consumer_group.clone(), consumer.clone());

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = consumer.recv() => {
                        match received {
                            Ok(message) => {
                                let Some(payload) = message.payload() else {
                                    warn!("received empty kafka message, skipping");
                                    continue;
                                };
                                let decoded: Result<BusMessage, _> = match topic {
                                    Topic::Keepalive => serde_json::from_slice(payload)
                                        .map(BusMessage::Keepalive),
                                    Topic::Event => serde_json::from_slice(payload)
                                        .map(BusMessage::Check),
                                };
                                match decoded {
                                    Ok(decoded) => {
                                        if tx.send(decoded).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => error!("failed to deserialize kafka message: {e}"),
                                }
                                if let Err(e) = consumer.commit_message(&message, rdkafka::consumer::CommitMode::Async) {
                                    error!("failed to commit kafka offset: {e}");
                                }
                            }
                            Err(e) => {
                                error!("error receiving kafka message: {e}");
                                tokio::time::sleep(Duration::from_millis(1000)).await;
                            }
                        }
                    }
                }
            }
            debug!(consumer_group, "kafka consumer loop ended");
        });

        Ok(rx)
    }

    async fn unsubscribe(&self, _topic: Topic, consumer_id: &str) {
        let consumer_group = format!("{}-{}", self.config.consumer_group_prefix, consumer_id);
        self.consumers.write().await.remove(&consumer_group);
    }

    async fn publish(&self, topic: Topic, message: BusMessage) -> Result<(), BusError> {
        let (key, payload) = match &message {
            BusMessage::Keepalive(event) => (event.entity.id.clone(), serde_json::to_vec(event)?),
            BusMessage::Check(event) => (event.entity.id.clone(), serde_json::to_vec(event)?),
        };

        let record = FutureRecord::to(topic.as_str()).key(&key).payload(&payload);
        let timeout = Timeout::After(self.config.timeout);

        self.producer
            .send(record, timeout)
            .await
            .map(|_| ())
            .map_err(|(e, _)| BusError::Transport(format!("kafka send failed: {e}")))
    }
}
