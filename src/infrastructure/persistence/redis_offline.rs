use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use redis::AsyncCommands;
use tracing::warn;

use super::{RedisKeys, redis_connection};
use crate::domain::model::ChatMessage;
use crate::domain::repository::OfflineStore;
use crate::error::Result;

/// Redis 离线队列
///
/// 每个接收方一个 ZSET（`im:offline:msg:<id>`），score 为消息时间戳（毫秒），
/// member 为消息 JSON。key 的过期时间与保留天数一致，每次写入时续期。
pub struct RedisOfflineStore {
    client: Arc<redis::Client>,
    keys: RedisKeys,
    retention_days: u32,
}

impl RedisOfflineStore {
    pub fn new(client: Arc<redis::Client>, keys: RedisKeys, retention_days: u32) -> Self {
        Self {
            client,
            keys,
            retention_days,
        }
    }

    fn retention_seconds(&self) -> i64 {
        i64::from(self.retention_days) * 24 * 3600
    }
}

#[async_trait]
impl OfflineStore for RedisOfflineStore {
    async fn enqueue(&self, receiver_id: i64, message: &ChatMessage) -> Result<()> {
        let key = self.keys.offline(receiver_id);
        let member = serde_json::to_string(message)?;
        let score = message.timestamp.timestamp_millis();

        let mut conn = redis_connection(&self.client).await?;
        let _: () = redis::pipe()
            .atomic()
            .zadd(&key, member, score)
            .ignore()
            .expire(&key, self.retention_seconds())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn drain(&self, receiver_id: i64) -> Result<Vec<ChatMessage>> {
        let key = self.keys.offline(receiver_id);
        let mut conn = redis_connection(&self.client).await?;

        // ZRANGE + DEL 在同一个事务中执行，并发的 drain 只有一个能拿到数据
        let results: Vec<Vec<(String, f64)>> = redis::pipe()
            .atomic()
            .zrange_withscores(&key, 0, -1)
            .del(&key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        let entries = results.into_iter().next().unwrap_or_default();

        let cutoff =
            (Utc::now() - Duration::days(i64::from(self.retention_days))).timestamp_millis();
        let mut messages = Vec::with_capacity(entries.len());
        for (raw, score) in entries {
            if (score as i64) < cutoff {
                continue;
            }
            match serde_json::from_str::<ChatMessage>(&raw) {
                Ok(message) => messages.push(message),
                Err(err) => warn!(receiver_id, error = %err, "dropping undecodable offline entry"),
            }
        }
        Ok(messages)
    }

    async fn pending_count(&self, receiver_id: i64) -> Result<usize> {
        let mut conn = redis_connection(&self.client).await?;
        let count: usize = conn.zcard(self.keys.offline(receiver_id)).await?;
        Ok(count)
    }
}
