//! 投递管线（生产端）
//!
//! 消息先记为 SENDING，再发布到持久化 topic；发布失败进入重试，
//! 失败次数达到上限后标记为 FAILED，不再自动处理，也不通知发送方。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DeliveryTopics;
use super::retry::RetryTracker;
use crate::domain::model::{ChatMessage, DeliveryStatus, ReadReceipt, RetryDecision};
use crate::domain::repository::{MessageBroker, Router};
use crate::error::Result;
use crate::metrics::GatewayMetrics;

/// 终态记录保留时间
const TERMINAL_STATUS_TTL_SECS: i64 = 3600;
/// 非终态（SENDING / PUSHED）记录默认保留时间，客户端从未确认的消息到期后清理
const DEFAULT_PENDING_STATUS_TTL_DAYS: i64 = 7;

/// 进程内投递状态
pub struct DeliveryTracker {
    statuses: DashMap<i64, (DeliveryStatus, DateTime<Utc>)>,
    pending_ttl: chrono::Duration,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::with_pending_ttl(chrono::Duration::days(DEFAULT_PENDING_STATUS_TTL_DAYS))
    }
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pending_ttl(pending_ttl: chrono::Duration) -> Self {
        Self {
            statuses: DashMap::new(),
            pending_ttl: pending_ttl.max(chrono::Duration::seconds(TERMINAL_STATUS_TTL_SECS)),
        }
    }

    /// 按状态机推进，非法迁移被忽略并返回 false
    pub fn advance(&self, message_id: i64, next: DeliveryStatus) -> bool {
        let now = Utc::now();
        match self.statuses.entry(message_id) {
            Entry::Vacant(slot) => {
                slot.insert((next, now));
                true
            }
            Entry::Occupied(mut entry) => {
                if entry.get().0.can_advance_to(next) {
                    entry.insert((next, now));
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn status(&self, message_id: i64) -> Option<DeliveryStatus> {
        self.statuses.get(&message_id).map(|entry| entry.0)
    }

    /// 清理超过保留时间的记录：终态按小时级保留，未确认的 SENDING / PUSHED 按 `pending_ttl`
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let terminal_cutoff = now - chrono::Duration::seconds(TERMINAL_STATUS_TTL_SECS);
        let pending_cutoff = now - self.pending_ttl;
        let before = self.statuses.len();
        self.statuses.retain(|_, (status, updated_at)| match status {
            DeliveryStatus::Delivered | DeliveryStatus::Failed => *updated_at > terminal_cutoff,
            _ => *updated_at > pending_cutoff,
        });
        before - self.statuses.len()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

pub struct DeliveryPipeline {
    broker: Arc<dyn MessageBroker>,
    topics: DeliveryTopics,
    retry: RetryTracker,
    tracker: Arc<DeliveryTracker>,
    metrics: Arc<GatewayMetrics>,
}

impl DeliveryPipeline {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        topics: DeliveryTopics,
        retry: RetryTracker,
        tracker: Arc<DeliveryTracker>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            broker,
            topics,
            retry,
            tracker,
            metrics,
        }
    }

    pub fn delivery_status(&self, message_id: i64) -> Option<DeliveryStatus> {
        self.tracker.status(message_id)
    }

    pub fn retry_tracker(&self) -> &RetryTracker {
        &self.retry
    }

    pub fn tracker(&self) -> Arc<DeliveryTracker> {
        Arc::clone(&self.tracker)
    }

    async fn publish_message(&self, topic: &str, message: &ChatMessage) -> Result<()> {
        self.tracker.advance(message.message_id, DeliveryStatus::Sending);
        let payload = serde_json::to_vec(message)?;

        match self
            .broker
            .publish(topic, &message.conversation_id, &payload)
            .await
        {
            Ok(()) => {
                debug!(message_id = message.message_id, topic, "message handed to broker");
            }
            Err(err) => {
                self.metrics
                    .broker_publish_failure_total
                    .with_label_values(&[topic])
                    .inc();
                let decision = self.retry.record_failure(
                    message.message_id,
                    topic,
                    &message.conversation_id,
                    payload,
                    Utc::now(),
                );
                self.on_failure(message.message_id, decision, &err.to_string());
            }
        }
        Ok(())
    }

    fn on_failure(&self, message_id: i64, decision: RetryDecision, reason: &str) {
        match decision {
            RetryDecision::RetryAt(at) => {
                warn!(
                    message_id,
                    next_attempt_at = %at,
                    error = reason,
                    "broker publish failed, retry scheduled"
                );
            }
            RetryDecision::Exhausted => {
                self.tracker.advance(message_id, DeliveryStatus::Failed);
                self.metrics.retry_exhausted_total.inc();
                error!(
                    message_id,
                    max_attempts = self.retry.policy().max_attempts,
                    error = reason,
                    "broker publish retries exhausted, message marked FAILED"
                );
            }
        }
    }

    /// 处理所有到期的重试票据，返回本轮尝试次数
    pub async fn process_due_retries(&self, now: DateTime<Utc>) -> usize {
        let due = self.retry.due(now);
        let attempted = due.len();

        for ticket in due {
            self.metrics.retry_attempts_total.inc();
            match self
                .broker
                .publish(&ticket.topic, &ticket.key, &ticket.payload)
                .await
            {
                Ok(()) => {
                    self.retry.remove(ticket.message_id);
                    info!(
                        message_id = ticket.message_id,
                        attempt = ticket.attempt_count + 1,
                        "retry publish succeeded"
                    );
                }
                Err(err) => {
                    self.metrics
                        .broker_publish_failure_total
                        .with_label_values(&[ticket.topic.as_str()])
                        .inc();
                    if let Some(decision) = self.retry.record_retry_failure(ticket.message_id, now)
                    {
                        self.on_failure(ticket.message_id, decision, &err.to_string());
                    }
                }
            }
        }

        attempted
    }

    /// 周期扫描重试票据，直到关闭
    pub async fn run_retry_loop(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "retry scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let attempted = self.process_due_retries(now).await;
                    if attempted > 0 {
                        debug!(attempted, pending = self.retry.len(), "retry scan finished");
                    }
                    self.tracker.prune(now);
                }
            }
        }

        info!(pending = self.retry.len(), "retry scheduler stopped");
    }
}

#[async_trait]
impl Router for DeliveryPipeline {
    async fn route_private(&self, message: ChatMessage) -> Result<()> {
        self.metrics
            .messages_accepted_total
            .with_label_values(&["private"])
            .inc();
        self.publish_message(&self.topics.private, &message).await
    }

    async fn route_group(&self, message: ChatMessage) -> Result<()> {
        self.metrics
            .messages_accepted_total
            .with_label_values(&["group"])
            .inc();
        self.publish_message(&self.topics.group, &message).await
    }

    async fn route_read_receipt(
        &self,
        reader_id: i64,
        message_ids: Vec<i64>,
        conversation_id: Option<String>,
    ) -> Result<()> {
        self.metrics
            .messages_accepted_total
            .with_label_values(&["read_receipt"])
            .inc();
        let receipt = ReadReceipt {
            reader_id,
            message_ids,
            conversation_id,
            read_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&receipt)?;
        let key = reader_id.to_string();

        if let Err(err) = self
            .broker
            .publish(&self.topics.read_receipt, &key, &payload)
            .await
        {
            self.metrics
                .broker_publish_failure_total
                .with_label_values(&[self.topics.read_receipt.as_str()])
                .inc();
            warn!(reader_id, error = %err, "failed to publish read receipt");
            return Err(err);
        }
        Ok(())
    }

    fn mark_pushed(&self, message_id: i64) {
        self.tracker.advance(message_id, DeliveryStatus::Pushed);
    }

    fn confirm_delivery(&self, message_id: i64) {
        self.tracker.advance(message_id, DeliveryStatus::Delivered);
        if self.retry.remove(message_id) {
            info!(message_id, "delivery confirmed by client, retry cancelled");
        } else {
            debug!(message_id, "delivery confirmed by client");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::domain::model::{ChatPayload, RetryPolicy};
    use crate::error::ImError;

    /// 前 `failures` 次发布失败
    struct FlakyBroker {
        failures: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl MessageBroker for FlakyBroker {
        async fn publish(&self, _topic: &str, _key: &str, _payload: &[u8]) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                Err(ImError::Broker("unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn pipeline(failures: u32) -> (DeliveryPipeline, Arc<FlakyBroker>) {
        let broker = Arc::new(FlakyBroker {
            failures,
            attempts: AtomicU32::new(0),
        });
        let pipeline = DeliveryPipeline::new(
            broker.clone(),
            DeliveryTopics::default(),
            RetryTracker::new(RetryPolicy::default()),
            Arc::new(DeliveryTracker::new()),
            Arc::new(GatewayMetrics::new()),
        );
        (pipeline, broker)
    }

    fn message(id: i64) -> ChatMessage {
        ChatMessage::private(
            id,
            1,
            ChatPayload {
                receiver_id: 2,
                content_type: 1,
                content: "hi".to_string(),
                client_msg_no: None,
                extra: None,
            },
        )
    }

    #[test]
    fn tracker_follows_status_machine() {
        let tracker = DeliveryTracker::new();
        assert!(tracker.advance(1, DeliveryStatus::Sending));
        assert!(!tracker.advance(1, DeliveryStatus::Sending));
        assert!(tracker.advance(1, DeliveryStatus::Pushed));
        assert!(!tracker.advance(1, DeliveryStatus::Sending));
        assert!(tracker.advance(1, DeliveryStatus::Delivered));
        assert!(!tracker.advance(1, DeliveryStatus::Failed));
        assert_eq!(tracker.status(1), Some(DeliveryStatus::Delivered));

        assert_eq!(tracker.prune(Utc::now()), 0);
        assert_eq!(tracker.prune(Utc::now() + ChronoDuration::hours(2)), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn unconfirmed_statuses_expire_after_pending_ttl() {
        let tracker = DeliveryTracker::with_pending_ttl(ChronoDuration::days(1));
        tracker.advance(1, DeliveryStatus::Sending);
        tracker.advance(2, DeliveryStatus::Sending);
        tracker.advance(2, DeliveryStatus::Pushed);
        tracker.advance(3, DeliveryStatus::Failed);

        assert_eq!(tracker.prune(Utc::now() + ChronoDuration::hours(2)), 1);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.status(2), Some(DeliveryStatus::Pushed));

        assert_eq!(tracker.prune(Utc::now() + ChronoDuration::days(2)), 2);
        assert!(tracker.is_empty());

        let tracker = DeliveryTracker::new();
        for id in 0..1000 {
            tracker.advance(id, DeliveryStatus::Sending);
            if id % 2 == 0 {
                tracker.advance(id, DeliveryStatus::Pushed);
            }
        }
        assert_eq!(tracker.prune(Utc::now() + ChronoDuration::days(30)), 1000);
    }

    #[tokio::test]
    async fn recovered_publish_clears_ticket() {
        let (pipeline, broker) = pipeline(1);
        pipeline.route_private(message(10)).await.unwrap();
        assert_eq!(pipeline.retry_tracker().len(), 1);
        assert_eq!(pipeline.delivery_status(10), Some(DeliveryStatus::Sending));

        let later = Utc::now() + ChronoDuration::minutes(5);
        assert_eq!(pipeline.process_due_retries(later).await, 1);
        assert!(pipeline.retry_tracker().is_empty());
        assert_eq!(broker.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_confirmation_cancels_retry() {
        let (pipeline, broker) = pipeline(u32::MAX);
        pipeline.route_group(message(11)).await.unwrap();
        pipeline.confirm_delivery(11);

        let later = Utc::now() + ChronoDuration::hours(1);
        assert_eq!(pipeline.process_due_retries(later).await, 0);
        assert_eq!(broker.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.delivery_status(11), Some(DeliveryStatus::Delivered));
    }
}
