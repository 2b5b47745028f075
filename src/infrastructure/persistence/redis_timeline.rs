use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::warn;

use super::{RedisKeys, redis_connection};
use crate::domain::model::ChatMessage;
use crate::domain::repository::TimelineIndex;
use crate::error::Result;

/// Redis 时间线缓存：ZSET，score 为消息时间戳（毫秒），只保留最近 `window` 条
pub struct RedisTimelineIndex {
    client: Arc<redis::Client>,
    keys: RedisKeys,
    window: usize,
}

impl RedisTimelineIndex {
    pub fn new(client: Arc<redis::Client>, keys: RedisKeys, window: usize) -> Self {
        Self {
            client,
            keys,
            window: window.max(1),
        }
    }

    fn trim_stop(&self) -> isize {
        -(self.window as isize) - 1
    }
}

#[async_trait]
impl TimelineIndex for RedisTimelineIndex {
    async fn append(&self, message: &ChatMessage) -> Result<()> {
        let key = self.keys.timeline(&message.conversation_id);
        let member = serde_json::to_string(message)?;
        let mut conn = redis_connection(&self.client).await?;
        let _: () = redis::pipe()
            .atomic()
            .zadd(&key, member, message.timestamp.timestamp_millis())
            .ignore()
            .zremrangebyrank(&key, 0, self.trim_stop())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn latest(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let key = self.keys.timeline(conversation_id);
        let mut conn = redis_connection(&self.client).await?;
        let raw: Vec<String> = conn.zrevrange(&key, 0, limit as isize - 1).await?;

        let mut messages: Vec<ChatMessage> = raw
            .iter()
            .filter_map(|item| match serde_json::from_str(item) {
                Ok(message) => Some(message),
                Err(err) => {
                    warn!(conversation_id, error = %err, "skipping undecodable timeline entry");
                    None
                }
            })
            .collect();
        messages.sort_by_key(|m: &ChatMessage| (m.sequence_number, m.timestamp));
        Ok(messages)
    }

    async fn replace(&self, conversation_id: &str, messages: &[ChatMessage]) -> Result<()> {
        let key = self.keys.timeline(conversation_id);
        let mut pipe = redis::pipe();
        pipe.atomic().del(&key).ignore();
        for message in messages {
            let member = serde_json::to_string(message)?;
            pipe.zadd(&key, member, message.timestamp.timestamp_millis())
                .ignore();
        }
        pipe.zremrangebyrank(&key, 0, self.trim_stop()).ignore();

        let mut conn = redis_connection(&self.client).await?;
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
