//! 本地会话注册表
//!
//! 用户 -> 当前连接，连接 -> 用户，两张 DashMap 分片加锁，所有操作只访问本地内存。
//! 集群在线状态通过后台执行器异步写入 [`PresenceStore`]，不在消息路由的关键路径上。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::domain::model::{ConnectionHandle, ConnectionId, Frame, Session};
use crate::domain::repository::{PresenceStore, SessionLookup};
use crate::utils::BackgroundExecutor;

pub struct SessionRegistry {
    node_id: String,
    sessions: DashMap<i64, Session>,
    connections: DashMap<ConnectionId, i64>,
    presence: Arc<dyn PresenceStore>,
    executor: BackgroundExecutor,
}

impl SessionRegistry {
    pub fn new(
        node_id: impl Into<String>,
        presence: Arc<dyn PresenceStore>,
        executor: BackgroundExecutor,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            sessions: DashMap::new(),
            connections: DashMap::new(),
            presence,
            executor,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// 绑定用户到新连接，返回被顶替的旧连接（由调用方按策略处理）
    pub fn bind(&self, user_id: i64, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let connection_id = handle.id();

        // 同一连接改用其他身份登录时先解除旧身份
        if let Some(previous_user) = self
            .connections
            .insert(connection_id, user_id)
            .filter(|previous| *previous != user_id)
        {
            self.remove_session_if_current(previous_user, connection_id);
        }

        let displaced = self
            .sessions
            .insert(user_id, Session::new(user_id, handle))
            .map(|old| old.handle)
            .filter(|old| old.id() != connection_id);

        if let Some(old) = &displaced {
            self.connections.remove_if(&old.id(), |_, uid| *uid == user_id);
            info!(
                user_id,
                old_connection = old.id(),
                new_connection = connection_id,
                "session rebound to a new connection"
            );
        } else {
            debug!(user_id, connection_id, "session bound");
        }

        self.publish_presence(user_id);
        displaced
    }

    /// 连接断开时调用；只有当前绑定的连接才会移除会话
    pub fn unbind(&self, connection_id: ConnectionId) -> Option<i64> {
        let (_, user_id) = self.connections.remove(&connection_id)?;
        if self.remove_session_if_current(user_id, connection_id) {
            Some(user_id)
        } else {
            debug!(user_id, connection_id, "stale unbind ignored");
            None
        }
    }

    fn remove_session_if_current(&self, user_id: i64, connection_id: ConnectionId) -> bool {
        let removed = self
            .sessions
            .remove_if(&user_id, |_, session| session.connection_id() == connection_id)
            .is_some();
        if removed {
            self.remove_presence(user_id);
        }
        removed
    }

    /// 连接是否仍是该用户的权威会话
    pub fn is_current(&self, user_id: i64, connection_id: ConnectionId) -> bool {
        self.sessions
            .get(&user_id)
            .is_some_and(|session| session.connection_id() == connection_id)
    }

    pub fn is_online_local(&self, user_id: i64) -> bool {
        self.sessions.contains_key(&user_id)
    }

    /// 本地或集群在线；集群状态可能短暂过期
    pub async fn is_online_global(&self, user_id: i64) -> bool {
        if self.is_online_local(user_id) {
            return true;
        }
        match self.presence.query_presence(user_id).await {
            Ok(node) => node.is_some(),
            Err(err) => {
                warn!(user_id, error = %err, "presence lookup failed");
                false
            }
        }
    }

    pub fn send_to_user(&self, user_id: i64, frame: Frame) -> bool {
        let Some(handle) = self.sessions.get(&user_id).map(|s| s.handle.clone()) else {
            return false;
        };
        let message_id = frame.message_id;
        let delivered = handle.try_send(frame);
        if !delivered {
            debug!(
                user_id,
                message_id,
                connection_id = handle.id(),
                "local push failed"
            );
        }
        delivered
    }

    /// 刷新心跳时间，并续期集群在线状态
    pub fn update_last_heartbeat(&self, connection_id: ConnectionId) {
        let Some(user_id) = self.connections.get(&connection_id).map(|u| *u) else {
            return;
        };
        let refreshed = match self.sessions.get_mut(&user_id) {
            Some(mut session) if session.connection_id() == connection_id => {
                session.touch();
                true
            }
            _ => false,
        };
        if refreshed {
            self.publish_presence(user_id);
        }
    }

    pub fn last_heartbeat(&self, user_id: i64) -> Option<DateTime<Utc>> {
        self.sessions.get(&user_id).map(|s| s.last_heartbeat_at)
    }

    pub fn session(&self, user_id: i64) -> Option<Session> {
        self.sessions.get(&user_id).map(|s| s.clone())
    }

    pub fn online_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn online_users(&self) -> Vec<i64> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// 关闭全部本地连接（停机）
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.handle.close();
        }
    }

    fn publish_presence(&self, user_id: i64) {
        let presence = Arc::clone(&self.presence);
        let node_id = self.node_id.clone();
        self.executor.spawn("presence_publish", async move {
            if let Err(err) = presence.publish_presence(user_id, &node_id).await {
                warn!(user_id, error = %err, "failed to publish presence");
            }
        });
    }

    fn remove_presence(&self, user_id: i64) {
        let presence = Arc::clone(&self.presence);
        let node_id = self.node_id.clone();
        self.executor.spawn("presence_remove", async move {
            if let Err(err) = presence.remove_presence(user_id, &node_id).await {
                warn!(user_id, error = %err, "failed to remove presence");
            }
        });
    }
}

impl SessionLookup for SessionRegistry {
    fn is_online_local(&self, user_id: i64) -> bool {
        SessionRegistry::is_online_local(self, user_id)
    }

    fn send_to_user(&self, user_id: i64, frame: Frame) -> bool {
        SessionRegistry::send_to_user(self, user_id, frame)
    }
}
