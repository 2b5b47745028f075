use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::info;

use super::{RedisKeys, redis_connection};
use crate::domain::repository::{MessageRepository, SequenceGenerator};
use crate::error::Result;

/// Redis INCR 序列号
///
/// key 不存在时（首次使用或 Redis 数据丢失）先用仓储中的最大序列号初始化，
/// 保证序列号在重启后不会回退。
pub struct RedisSequenceGenerator {
    client: Arc<redis::Client>,
    keys: RedisKeys,
    repository: Arc<dyn MessageRepository>,
}

impl RedisSequenceGenerator {
    pub fn new(
        client: Arc<redis::Client>,
        keys: RedisKeys,
        repository: Arc<dyn MessageRepository>,
    ) -> Self {
        Self {
            client,
            keys,
            repository,
        }
    }
}

#[async_trait]
impl SequenceGenerator for RedisSequenceGenerator {
    async fn next_sequence(&self, conversation_id: &str) -> Result<i64> {
        let key = self.keys.sequence(conversation_id);
        let mut conn = redis_connection(&self.client).await?;

        let exists: bool = conn.exists(&key).await?;
        if !exists {
            let floor = self.repository.max_sequence(conversation_id).await?;
            let seeded: bool = conn.set_nx(&key, floor).await?;
            if seeded {
                info!(conversation_id, floor, "sequence counter initialised");
            }
        }

        let next: i64 = conn.incr(&key, 1).await?;
        Ok(next)
    }
}
