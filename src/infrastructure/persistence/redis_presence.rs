use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

use super::{RedisKeys, redis_connection};
use crate::domain::repository::PresenceStore;
use crate::error::Result;

/// 只有记录的节点与调用方一致时才删除，避免新节点上的登录被旧节点的断开覆盖
const REMOVE_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[2]) == ARGV[1] then
    redis.call('DEL', KEYS[1], KEYS[2])
    return 1
end
return 0
"#;

/// Redis 在线状态
///
/// - `im:online:user:<id>`：在线标记
/// - `im:user:server:<id>`：所在节点
///
/// 两个 key 使用相同 TTL，心跳时续期。
pub struct RedisPresenceStore {
    client: Arc<redis::Client>,
    keys: RedisKeys,
    ttl_seconds: u64,
}

impl RedisPresenceStore {
    pub fn new(client: Arc<redis::Client>, keys: RedisKeys, ttl_seconds: u64) -> Self {
        Self {
            client,
            keys,
            ttl_seconds: ttl_seconds.max(1),
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn publish_presence(&self, user_id: i64, node_id: &str) -> Result<()> {
        let mut conn = redis_connection(&self.client).await?;
        let _: () = redis::pipe()
            .atomic()
            .set_ex(self.keys.online(user_id), 1, self.ttl_seconds)
            .ignore()
            .set_ex(self.keys.user_server(user_id), node_id, self.ttl_seconds)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_presence(&self, user_id: i64, node_id: &str) -> Result<()> {
        let mut conn = redis_connection(&self.client).await?;
        let removed: i32 = redis::Script::new(REMOVE_IF_OWNER)
            .key(self.keys.online(user_id))
            .key(self.keys.user_server(user_id))
            .arg(node_id)
            .invoke_async(&mut conn)
            .await?;
        if removed == 0 {
            debug!(user_id, node_id, "presence owned by another node, kept");
        }
        Ok(())
    }

    async fn query_presence(&self, user_id: i64) -> Result<Option<String>> {
        let mut conn = redis_connection(&self.client).await?;
        let node: Option<String> = conn.get(self.keys.user_server(user_id)).await?;
        Ok(node)
    }
}
