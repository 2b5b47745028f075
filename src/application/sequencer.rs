//! 会话序列号与最近消息时间线

use std::sync::Arc;

use tracing::{info, warn};

use crate::domain::model::ChatMessage;
use crate::domain::repository::{MessageRepository, SequenceGenerator, TimelineIndex};
use crate::error::Result;

pub struct Sequencer {
    generator: Arc<dyn SequenceGenerator>,
    timeline: Arc<dyn TimelineIndex>,
    repository: Arc<dyn MessageRepository>,
    window: usize,
}

impl Sequencer {
    pub fn new(
        generator: Arc<dyn SequenceGenerator>,
        timeline: Arc<dyn TimelineIndex>,
        repository: Arc<dyn MessageRepository>,
        window: usize,
    ) -> Self {
        Self {
            generator,
            timeline,
            repository,
            window: window.max(1),
        }
    }

    pub async fn next_sequence(&self, conversation_id: &str) -> Result<i64> {
        self.generator.next_sequence(conversation_id).await
    }

    /// 写入时间线缓存；缓存失败不影响消息本身
    pub async fn record(&self, message: &ChatMessage) {
        if let Err(err) = self.timeline.append(message).await {
            warn!(
                conversation_id = %message.conversation_id,
                message_id = message.message_id,
                error = %err,
                "failed to append to timeline"
            );
        }
    }

    /// 最近 `limit` 条消息；缓存为空时从仓储重建
    pub async fn latest(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let limit = limit.min(self.window);
        let cached = self.timeline.latest(conversation_id, limit).await?;
        if !cached.is_empty() {
            return Ok(cached);
        }

        self.rebuild_timeline(conversation_id).await?;
        self.timeline.latest(conversation_id, limit).await
    }

    /// 从仓储重新加载最近窗口，返回加载条数
    pub async fn rebuild_timeline(&self, conversation_id: &str) -> Result<usize> {
        let messages = self
            .repository
            .list_recent(conversation_id, self.window)
            .await?;
        self.timeline.replace(conversation_id, &messages).await?;
        info!(conversation_id, loaded = messages.len(), "timeline rebuilt");
        Ok(messages.len())
    }
}
