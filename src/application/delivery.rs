//! 接收方路由：本地直推 -> 跨节点路由 topic -> 离线队列

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::offline::OfflineReplayService;
use crate::domain::model::{ChatMessage, RouteRecord};
use crate::domain::repository::{MessageBroker, OfflineStore, PresenceStore, SessionLookup};
use crate::error::Result;
use crate::metrics::GatewayMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 已写入本地连接
    Local,
    /// 已转发到目标节点
    Remote(String),
    /// 已写入离线队列
    Offline,
}

impl DeliveryOutcome {
    pub fn is_pushed(&self) -> bool {
        !matches!(self, Self::Offline)
    }
}

pub struct DeliveryRouter {
    node_id: String,
    route_topic: String,
    sessions: Arc<dyn SessionLookup>,
    presence: Arc<dyn PresenceStore>,
    broker: Arc<dyn MessageBroker>,
    offline: Arc<dyn OfflineStore>,
    replay: Arc<OfflineReplayService>,
    metrics: Arc<GatewayMetrics>,
}

impl DeliveryRouter {
    pub fn new(
        node_id: impl Into<String>,
        route_topic: impl Into<String>,
        sessions: Arc<dyn SessionLookup>,
        presence: Arc<dyn PresenceStore>,
        broker: Arc<dyn MessageBroker>,
        offline: Arc<dyn OfflineStore>,
        replay: Arc<OfflineReplayService>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            route_topic: route_topic.into(),
            sessions,
            presence,
            broker,
            offline,
            replay,
            metrics,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// 投递给单个接收方
    ///
    /// 路由失败时降级为离线存储，不会向发送方报告。
    pub async fn deliver(
        &self,
        recipient_id: i64,
        message: &ChatMessage,
    ) -> Result<DeliveryOutcome> {
        if self.sessions.send_to_user(recipient_id, message.to_push_frame()?) {
            return Ok(DeliveryOutcome::Local);
        }

        let node = match self.presence.query_presence(recipient_id).await {
            Ok(node) => node,
            Err(err) => {
                warn!(recipient_id, error = %err, "presence lookup failed, storing offline");
                None
            }
        };

        match node {
            Some(node) if node != self.node_id => {
                let record = RouteRecord {
                    target_node: node.clone(),
                    recipient_id,
                    message: message.clone(),
                };
                let payload = serde_json::to_vec(&record)?;
                match self
                    .broker
                    .publish(&self.route_topic, &recipient_id.to_string(), &payload)
                    .await
                {
                    Ok(()) => {
                        debug!(
                            recipient_id,
                            message_id = message.message_id,
                            target_node = %node,
                            "message routed to remote node"
                        );
                        Ok(DeliveryOutcome::Remote(node))
                    }
                    Err(err) => {
                        self.metrics
                            .broker_publish_failure_total
                            .with_label_values(&[self.route_topic.as_str()])
                            .inc();
                        warn!(
                            recipient_id,
                            target_node = %node,
                            error = %err,
                            "cross-node routing failed, storing offline"
                        );
                        self.store_offline(recipient_id, message).await
                    }
                }
            }
            _ => self.store_offline(recipient_id, message).await,
        }
    }

    /// 路由 topic 上的记录：目标就是本节点，不再继续转发
    pub async fn deliver_local_or_offline(
        &self,
        recipient_id: i64,
        message: &ChatMessage,
    ) -> Result<DeliveryOutcome> {
        if self.sessions.send_to_user(recipient_id, message.to_push_frame()?) {
            return Ok(DeliveryOutcome::Local);
        }
        self.store_offline(recipient_id, message).await
    }

    /// 写入离线队列
    ///
    /// 写入后接收方若已在本节点上线（登录补发可能早于本次写入完成），立即补发一次，
    /// 补发与登录触发的补发共用用户级锁，同一条消息不会推送两次。
    pub async fn store_offline(
        &self,
        recipient_id: i64,
        message: &ChatMessage,
    ) -> Result<DeliveryOutcome> {
        self.offline.enqueue(recipient_id, message).await?;
        self.metrics.offline_enqueued_total.inc();

        if self.sessions.is_online_local(recipient_id) {
            let report = self.replay.replay(recipient_id).await?;
            debug!(
                recipient_id,
                message_id = message.message_id,
                delivered = report.delivered,
                requeued = report.requeued,
                "recipient came online during offline store, replayed"
            );
            if report.delivered > 0 && report.requeued == 0 {
                return Ok(DeliveryOutcome::Local);
            }
            return Ok(DeliveryOutcome::Offline);
        }

        info!(
            recipient_id,
            message_id = message.message_id,
            "recipient offline, message stored"
        );
        Ok(DeliveryOutcome::Offline)
    }
}
