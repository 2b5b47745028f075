//! MQ 消费端：持久化、分配序列号、投递
//!
//! 同一条记录可能被重复消费（生产端重试、消费端未提交位点），持久化按 message_id 幂等，
//! 重复记录不会分配新的序列号，但仍会再尝试一次投递。
//! message_id 已被其他发送方占用时，按发送方派生新的 ID 后再写入。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use super::DeliveryTopics;
use super::delivery::DeliveryRouter;
use super::pipeline::DeliveryTracker;
use super::sequencer::Sequencer;
use crate::domain::model::{ChatMessage, DeliveryStatus, ReadReceipt, RouteRecord};
use crate::domain::repository::{GroupDirectory, MessageRepository, RecordHandler};
use crate::error::{ImError, Result};
use crate::metrics::GatewayMetrics;
use crate::utils::scoped_message_id;

/// 派生 ID 仍然冲突时的最大重试次数
const MAX_MESSAGE_ID_REMAPS: usize = 3;

pub struct DeliveryConsumer {
    repository: Arc<dyn MessageRepository>,
    sequencer: Arc<Sequencer>,
    router: Arc<DeliveryRouter>,
    groups: Arc<dyn GroupDirectory>,
    tracker: Arc<DeliveryTracker>,
    topics: DeliveryTopics,
    metrics: Arc<GatewayMetrics>,
}

impl DeliveryConsumer {
    pub fn new(
        repository: Arc<dyn MessageRepository>,
        sequencer: Arc<Sequencer>,
        router: Arc<DeliveryRouter>,
        groups: Arc<dyn GroupDirectory>,
        tracker: Arc<DeliveryTracker>,
        topics: DeliveryTopics,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            repository,
            sequencer,
            router,
            groups,
            tracker,
            topics,
            metrics,
        }
    }

    /// 幂等持久化，返回已入库的消息（含序列号）
    ///
    /// 同一发送方的同一 message_id 视为重复；不同发送方撞上同一 ID 时改用派生 ID。
    pub async fn persist(&self, mut message: ChatMessage) -> Result<ChatMessage> {
        for _ in 0..=MAX_MESSAGE_ID_REMAPS {
            if let Some(existing) = self.repository.find_message(message.message_id).await? {
                if existing.sender_id == message.sender_id {
                    debug!(message_id = message.message_id, "message already persisted");
                    return Ok(existing);
                }
                self.remap_message_id(&mut message, existing.sender_id);
                continue;
            }

            let started = Instant::now();
            let sequence = self
                .sequencer
                .next_sequence(&message.conversation_id)
                .await?;
            message.sequence_number = Some(sequence);

            let inserted = self.repository.save_message(&message).await?;
            self.metrics
                .persist_duration_seconds
                .observe(started.elapsed().as_secs_f64());

            if !inserted {
                // 并发写入同一 ID：以先写入者为准，本次分配的序列号作废
                match self.repository.find_message(message.message_id).await? {
                    Some(existing) if existing.sender_id == message.sender_id => {
                        return Ok(existing);
                    }
                    Some(existing) => {
                        message.sequence_number = None;
                        self.remap_message_id(&mut message, existing.sender_id);
                        continue;
                    }
                    None => return Ok(message),
                }
            }

            self.sequencer.record(&message).await;
            debug!(
                message_id = message.message_id,
                conversation_id = %message.conversation_id,
                sequence,
                "message persisted"
            );
            return Ok(message);
        }

        Err(ImError::Storage(format!(
            "message id {} still conflicts after remapping",
            message.message_id
        )))
    }

    fn remap_message_id(&self, message: &mut ChatMessage, owner: i64) {
        let scoped = scoped_message_id(message.sender_id, message.message_id);
        warn!(
            message_id = message.message_id,
            sender_id = message.sender_id,
            owner,
            scoped_message_id = scoped,
            "message id owned by another sender, remapped"
        );
        message.message_id = scoped;
    }

    #[instrument(skip_all, fields(message_id = message.message_id))]
    async fn handle_private(&self, message: ChatMessage) -> Result<()> {
        let message = self.persist(message).await?;
        let outcome = self.router.deliver(message.receiver_id, &message).await?;
        if outcome.is_pushed() {
            self.mark_pushed(message.message_id).await;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(message_id = message.message_id))]
    async fn handle_group(&self, message: ChatMessage) -> Result<()> {
        let message = self.persist(message).await?;
        let members = self.groups.get_group_member_ids(message.receiver_id).await?;

        let mut seen = HashSet::with_capacity(members.len());
        let mut pushed = 0usize;
        let mut offline = 0usize;
        for member in members {
            if member == message.sender_id || !seen.insert(member) {
                continue;
            }
            // 单个成员失败不影响其他成员
            match self.router.deliver(member, &message).await {
                Ok(outcome) if outcome.is_pushed() => pushed += 1,
                Ok(_) => offline += 1,
                Err(err) => {
                    warn!(member_id = member, error = %err, "group fan-out to member failed")
                }
            }
        }

        if pushed > 0 {
            self.mark_pushed(message.message_id).await;
        }
        info!(pushed, offline, "group message fanned out");
        Ok(())
    }

    async fn handle_route(&self, record: RouteRecord) -> Result<()> {
        if record.target_node != self.router.node_id() {
            return Ok(());
        }
        let outcome = self
            .router
            .deliver_local_or_offline(record.recipient_id, &record.message)
            .await?;
        debug!(
            recipient_id = record.recipient_id,
            message_id = record.message.message_id,
            ?outcome,
            "routed message handled"
        );
        Ok(())
    }

    async fn handle_read_receipt(&self, receipt: ReadReceipt) -> Result<()> {
        let updated = self
            .repository
            .mark_read(receipt.reader_id, &receipt.message_ids)
            .await?;
        debug!(
            reader_id = receipt.reader_id,
            requested = receipt.message_ids.len(),
            updated,
            "read receipt applied"
        );
        Ok(())
    }

    async fn mark_pushed(&self, message_id: i64) {
        self.tracker.advance(message_id, DeliveryStatus::Pushed);
        if let Err(err) = self
            .repository
            .update_delivery_status(message_id, DeliveryStatus::Pushed)
            .await
        {
            warn!(message_id, error = %err, "failed to update delivery status");
        }
    }
}

/// 无法解析的记录重试也没有意义，记录日志后视为已处理
fn decode<T: DeserializeOwned>(topic: &str, payload: &[u8]) -> Option<T> {
    match serde_json::from_slice(payload) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(topic, error = %err, "malformed broker record skipped");
            None
        }
    }
}

#[async_trait]
impl RecordHandler for DeliveryConsumer {
    async fn handle_record(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if topic == self.topics.private {
            match decode(topic, payload) {
                Some(message) => self.handle_private(message).await,
                None => Ok(()),
            }
        } else if topic == self.topics.group {
            match decode(topic, payload) {
                Some(message) => self.handle_group(message).await,
                None => Ok(()),
            }
        } else if topic == self.topics.route {
            match decode(topic, payload) {
                Some(record) => self.handle_route(record).await,
                None => Ok(()),
            }
        } else if topic == self.topics.read_receipt {
            match decode(topic, payload) {
                Some(receipt) => self.handle_read_receipt(receipt).await,
                None => Ok(()),
            }
        } else {
            warn!(topic, "record from unexpected topic ignored");
            Ok(())
        }
    }
}
