//! 协作方接口
//!
//! 基础设施层提供实现（Kafka / Redis / Postgres / 内存），应用层只依赖这些 trait。

use std::collections::HashMap;

use async_trait::async_trait;

use super::model::{AuthPayload, ChatMessage, DeliveryStatus, Frame};
use crate::error::Result;

/// 消息队列生产端
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;
}

/// 消息队列消费端回调
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle_record(&self, topic: &str, payload: &[u8]) -> Result<()>;
}

/// 集群在线状态（允许短暂过期）
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// 写入 / 刷新用户所在节点
    async fn publish_presence(&self, user_id: i64, node_id: &str) -> Result<()>;
    /// 仅当记录的节点与 `node_id` 一致时删除
    async fn remove_presence(&self, user_id: i64, node_id: &str) -> Result<()>;
    async fn query_presence(&self, user_id: i64) -> Result<Option<String>>;

    async fn query_presence_batch(&self, user_ids: &[i64]) -> Result<HashMap<i64, String>> {
        let mut found = HashMap::with_capacity(user_ids.len());
        for &user_id in user_ids {
            if let Some(node) = self.query_presence(user_id).await? {
                found.insert(user_id, node);
            }
        }
        Ok(found)
    }
}

/// 离线消息队列：多写单取
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// 追加离线消息，同一 message_id 只保留一份
    async fn enqueue(&self, receiver_id: i64, message: &ChatMessage) -> Result<()>;
    /// 原子地取出并删除全部离线消息（按时间升序，已过保留期的被丢弃）
    async fn drain(&self, receiver_id: i64) -> Result<Vec<ChatMessage>>;
    async fn pending_count(&self, receiver_id: i64) -> Result<usize>;
}

/// 会话内序列号生成
#[async_trait]
pub trait SequenceGenerator: Send + Sync {
    async fn next_sequence(&self, conversation_id: &str) -> Result<i64>;
}

/// 会话最近消息缓存
#[async_trait]
pub trait TimelineIndex: Send + Sync {
    async fn append(&self, message: &ChatMessage) -> Result<()>;
    /// 最近 `limit` 条，按序列号升序
    async fn latest(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>>;
    /// 用给定消息替换缓存内容
    async fn replace(&self, conversation_id: &str, messages: &[ChatMessage]) -> Result<()>;
}

/// 消息持久化
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 按 message_id 幂等写入；已存在时返回 false
    async fn save_message(&self, message: &ChatMessage) -> Result<bool>;
    async fn find_message(&self, message_id: i64) -> Result<Option<ChatMessage>>;
    /// 只更新发给 `reader_id` 的单聊消息，返回实际更新的条数
    async fn mark_read(&self, reader_id: i64, message_ids: &[i64]) -> Result<u64>;
    async fn update_delivery_status(&self, message_id: i64, status: DeliveryStatus) -> Result<()>;
    /// 会话当前最大序列号，无消息时为 0
    async fn max_sequence(&self, conversation_id: &str) -> Result<i64>;
    /// 最近 `limit` 条，按序列号升序
    async fn list_recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>>;
}

/// 身份校验（外部认证服务）
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    async fn validate_identity(&self, claim: &AuthPayload) -> Result<i64>;
}

/// 群成员查询（外部 IM 业务服务）
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn get_group_member_ids(&self, group_id: i64) -> Result<Vec<i64>>;
}

/// 本地会话查询，投递路由只通过该接口访问会话表
pub trait SessionLookup: Send + Sync {
    fn is_online_local(&self, user_id: i64) -> bool;
    /// 非阻塞推送，未绑定或写入失败时返回 false
    fn send_to_user(&self, user_id: i64, frame: Frame) -> bool;
}

/// 分发引擎依赖的投递入口
#[async_trait]
pub trait Router: Send + Sync {
    async fn route_private(&self, message: ChatMessage) -> Result<()>;
    async fn route_group(&self, message: ChatMessage) -> Result<()>;
    async fn route_read_receipt(
        &self,
        reader_id: i64,
        message_ids: Vec<i64>,
        conversation_id: Option<String>,
    ) -> Result<()>;
    /// 本地直推成功
    fn mark_pushed(&self, message_id: i64);
    /// 客户端确认送达，停止重试
    fn confirm_delivery(&self, message_id: i64);
}
