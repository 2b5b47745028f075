//! 连接级有序移交队列
//!
//! 同一连接上的聊天、群聊和已读回执按到达顺序交给 [`Router`]，
//! 同一时刻每个连接最多只有一个后台任务在排空队列。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use crate::domain::model::ChatMessage;
use crate::domain::repository::Router;

/// 等待移交给投递管线的入站消息
#[derive(Debug)]
pub enum Handoff {
    Private(ChatMessage),
    Group(ChatMessage),
    ReadReceipt {
        reader_id: i64,
        message_ids: Vec<i64>,
        conversation_id: Option<String>,
    },
}

impl Handoff {
    async fn route(self, router: &dyn Router) {
        match self {
            Handoff::Private(message) => {
                let message_id = message.message_id;
                if let Err(err) = router.route_private(message).await {
                    warn!(message_id, error = %err, "private message routing failed");
                }
            }
            Handoff::Group(message) => {
                let message_id = message.message_id;
                if let Err(err) = router.route_group(message).await {
                    warn!(message_id, error = %err, "group message routing failed");
                }
            }
            Handoff::ReadReceipt {
                reader_id,
                message_ids,
                conversation_id,
            } => {
                if let Err(err) = router
                    .route_read_receipt(reader_id, message_ids, conversation_id)
                    .await
                {
                    warn!(reader_id, error = %err, "read receipt routing failed");
                }
            }
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Handoff>,
    draining: bool,
}

#[derive(Clone, Default)]
pub struct HandoffQueue {
    state: Arc<Mutex<QueueState>>,
}

impl HandoffQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队；返回 true 表示调用方需要启动排空任务
    pub fn enqueue(&self, handoff: Handoff) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending.push_back(handoff);
        if state.draining {
            false
        } else {
            state.draining = true;
            true
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next(&self) -> Option<Handoff> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let next = state.pending.pop_front();
        if next.is_none() {
            state.draining = false;
        }
        next
    }

    /// 按入队顺序逐条移交，队列为空时退出
    pub async fn drain(&self, router: Arc<dyn Router>) {
        while let Some(handoff) = self.next() {
            handoff.route(router.as_ref()).await;
        }
    }
}
