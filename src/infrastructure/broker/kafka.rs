//! Kafka 生产者与消费者

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::redelivery_delay;
use crate::config::BrokerConfig;
use crate::domain::repository::{MessageBroker, RecordHandler};
use crate::error::{ImError, Result};

pub struct KafkaMessageBroker {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaMessageBroker {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("message.timeout.ms", config.publish_timeout_ms.to_string())
            .set("acks", "all");
        for (key, value) in &config.options {
            client.set(key, value);
        }
        let producer: FutureProducer = client.create()?;

        info!(
            bootstrap = %config.bootstrap_servers,
            "Kafka producer initialized"
        );

        Ok(Self {
            producer,
            timeout: Duration::from_millis(config.publish_timeout_ms),
        })
    }
}

#[async_trait]
impl MessageBroker for KafkaMessageBroker {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        match self.producer.send(record, self.timeout).await {
            Ok(_) => {
                debug!(topic, key, "record published");
                Ok(())
            }
            Err((err, _)) => {
                warn!(topic, key, error = %err, "failed to publish record");
                Err(ImError::Kafka(err))
            }
        }
    }
}

/// Kafka 消费者：逐条交给 [`RecordHandler`]，处理成功后提交 offset
pub struct KafkaRecordConsumer {
    consumer: StreamConsumer,
    group_id: String,
    topics: Vec<String>,
    redelivery_backoff: Duration,
    max_redelivery_backoff: Duration,
}

impl KafkaRecordConsumer {
    pub fn new(config: &BrokerConfig, group_id: &str, topics: Vec<String>) -> Result<Self> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000");
        for (key, value) in &config.options {
            client.set(key, value);
        }
        let consumer: StreamConsumer = client.create()?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs)?;

        info!(
            bootstrap = %config.bootstrap_servers,
            group = %group_id,
            topics = ?topics,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            group_id: group_id.to_string(),
            topics,
            redelivery_backoff: Duration::from_millis(config.redelivery_backoff_ms),
            max_redelivery_backoff: Duration::from_millis(
                config.redelivery_max_backoff_ms.max(config.redelivery_backoff_ms),
            ),
        })
    }

    pub async fn run(&self, handler: Arc<dyn RecordHandler>, shutdown: CancellationToken) {
        info!(group = %self.group_id, topics = ?self.topics, "consumer started");
        let mut consecutive_errors = 0u32;

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.consumer.recv() => received,
            };

            match received {
                Ok(message) => {
                    consecutive_errors = 0;

                    let handled = self
                        .handle_until_success(handler.as_ref(), &message, &shutdown)
                        .await;
                    if !handled {
                        // 未提交的 offset 在重新分配或重启后从这条记录继续
                        break;
                    }
                    if let Err(err) = self.consumer.commit_message(&message, CommitMode::Async) {
                        warn!(topic = message.topic(), error = %err, "failed to commit offset");
                    }
                }
                Err(err) => {
                    consecutive_errors += 1;
                    warn!(
                        group = %self.group_id,
                        error = %err,
                        consecutive_errors,
                        "consumer error"
                    );
                    let backoff =
                        Duration::from_millis(200 * u64::from(consecutive_errors.min(25)));
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!(group = %self.group_id, "consumer stopped");
    }

    /// 原地重试同一条记录，直到处理成功（返回 true）或停机（返回 false）
    async fn handle_until_success(
        &self,
        handler: &dyn RecordHandler,
        message: &BorrowedMessage<'_>,
        shutdown: &CancellationToken,
    ) -> bool {
        let topic = message.topic();
        let payload = message.payload().unwrap_or_default();
        let mut failures = 0u32;
        loop {
            match handler.handle_record(topic, payload).await {
                Ok(()) => return true,
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = redelivery_delay(
                        self.redelivery_backoff,
                        self.max_redelivery_backoff,
                        failures,
                    );
                    error!(
                        topic,
                        partition = message.partition(),
                        offset = message.offset(),
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "failed to handle record, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
