//! 持久化适配器：在线状态、离线队列、序列号、时间线、消息仓储
//!
//! 每类存储提供 Redis / Postgres 实现和内存实现（单节点部署与测试使用）。

pub mod in_memory;
pub mod postgres;
pub mod redis_offline;
pub mod redis_presence;
pub mod redis_sequence;
pub mod redis_timeline;

pub use in_memory::{
    InMemoryMessageRepository, InMemoryOfflineStore, InMemoryPresenceStore,
    InMemorySequenceGenerator, InMemoryTimelineIndex,
};
pub use postgres::PostgresMessageRepository;
pub use redis_offline::RedisOfflineStore;
pub use redis_presence::RedisPresenceStore;
pub use redis_sequence::RedisSequenceGenerator;
pub use redis_timeline::RedisTimelineIndex;

use redis::aio::ConnectionManager;

use crate::error::Result;

/// Redis key 约定
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn online(&self, user_id: i64) -> String {
        format!("{}:online:user:{}", self.prefix, user_id)
    }

    pub fn user_server(&self, user_id: i64) -> String {
        format!("{}:user:server:{}", self.prefix, user_id)
    }

    pub fn offline(&self, user_id: i64) -> String {
        format!("{}:offline:msg:{}", self.prefix, user_id)
    }

    pub fn sequence(&self, conversation_id: &str) -> String {
        format!("{}:seq:{}", self.prefix, conversation_id)
    }

    pub fn timeline(&self, conversation_id: &str) -> String {
        format!("{}:timeline:{}", self.prefix, conversation_id)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("im")
    }
}

pub(crate) async fn redis_connection(client: &redis::Client) -> Result<ConnectionManager> {
    Ok(ConnectionManager::new(client.clone()).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let keys = RedisKeys::default();
        assert_eq!(keys.online(7), "im:online:user:7");
        assert_eq!(keys.user_server(7), "im:user:server:7");
        assert_eq!(keys.offline(7), "im:offline:msg:7");
        assert_eq!(keys.sequence("private_1_2"), "im:seq:private_1_2");
        assert_eq!(keys.timeline("group_3"), "im:timeline:group_3");
    }
}
