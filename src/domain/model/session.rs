use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::Frame;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 分配进程内唯一的连接 ID
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// 连接句柄：向连接的发送队列投递帧，或请求关闭连接
///
/// 发送队列有界，写满时直接失败，不阻塞调用方。
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    outbound: mpsc::Sender<Frame>,
    close: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        outbound: mpsc::Sender<Frame>,
        close: CancellationToken,
    ) -> Self {
        Self {
            id,
            remote_addr,
            outbound,
            close,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// 非阻塞写入；队列已满或连接已关闭时返回 false
    pub fn try_send(&self, frame: Frame) -> bool {
        !self.close.is_cancelled() && self.outbound.try_send(frame).is_ok()
    }

    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.outbound.is_closed()
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.close.clone()
    }
}

/// 本地会话：用户与其当前权威连接的绑定
#[derive(Clone, Debug)]
pub struct Session {
    pub user_id: i64,
    pub handle: ConnectionHandle,
    pub bound_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: i64, handle: ConnectionHandle) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            handle,
            bound_at: now,
            last_heartbeat_at: now,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn touch(&mut self) {
        self.last_heartbeat_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::frame::Frame;

    #[test]
    fn try_send_fails_fast_when_full_or_closed() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(next_connection_id(), None, tx, CancellationToken::new());

        assert!(handle.try_send(Frame::chat_ack(1)));
        assert!(!handle.try_send(Frame::chat_ack(2)));
        assert_eq!(rx.try_recv().unwrap().message_id, 1);

        handle.close();
        assert!(handle.is_closed());
        assert!(!handle.try_send(Frame::chat_ack(3)));
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert_ne!(a, b);
    }
}
