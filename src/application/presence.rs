//! 在线状态查询与服务端主动推送

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::model::{Frame, FrameStatus, MessageType};
use crate::domain::repository::PresenceStore;
use crate::infrastructure::SessionRegistry;
use crate::utils::id::next_server_message_id;

pub struct OnlineQueryService {
    registry: Arc<SessionRegistry>,
    presence: Arc<dyn PresenceStore>,
}

impl OnlineQueryService {
    pub fn new(registry: Arc<SessionRegistry>, presence: Arc<dyn PresenceStore>) -> Self {
        Self { registry, presence }
    }

    pub async fn is_online(&self, user_id: i64) -> bool {
        self.registry.is_online_global(user_id).await
    }

    /// 批量查询；本地会话优先，其余走集群在线状态
    pub async fn get_online_status(&self, user_ids: &[i64]) -> HashMap<i64, bool> {
        let mut status: HashMap<i64, bool> = user_ids
            .iter()
            .map(|&user_id| (user_id, self.registry.is_online_local(user_id)))
            .collect();

        let remote: Vec<i64> = status
            .iter()
            .filter(|(_, online)| !**online)
            .map(|(user_id, _)| *user_id)
            .collect();
        if remote.is_empty() {
            return status;
        }

        match self.presence.query_presence_batch(&remote).await {
            Ok(found) => {
                for user_id in found.into_keys() {
                    status.insert(user_id, true);
                }
            }
            Err(err) => warn!(users = remote.len(), error = %err, "batch presence lookup failed"),
        }
        status
    }

    /// 服务端主动推送：载荷包装为 CHAT_MESSAGE 帧，消息 ID 由服务端生成
    pub fn send_to_user(&self, user_id: i64, payload: &serde_json::Value) -> bool {
        let frame = match Frame::json(
            MessageType::ChatMessage,
            next_server_message_id(),
            FrameStatus::Success,
            payload,
        ) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(user_id, error = %err, "server push payload not encodable");
                return false;
            }
        };
        let message_id = frame.message_id;
        let delivered = self.registry.send_to_user(user_id, frame);
        debug!(user_id, message_id, delivered, "server push");
        delivered
    }

    pub fn local_online_count(&self) -> usize {
        self.registry.online_count()
    }

    pub fn local_online_users(&self) -> Vec<i64> {
        self.registry.online_users()
    }
}
