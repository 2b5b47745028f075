//! 内存存储实现
//!
//! 单节点部署与测试使用；序列号生成器可以用消息仓储中的最大序列号做起点，
//! 保证进程重启后不会复用已分配的序列号。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::domain::model::{ChatMessage, ConversationKind, DeliveryStatus};
use crate::domain::repository::{
    MessageRepository, OfflineStore, PresenceStore, SequenceGenerator, TimelineIndex,
};
use crate::error::Result;

/// 内存在线状态，带过期时间
pub struct InMemoryPresenceStore {
    ttl: Duration,
    entries: DashMap<i64, (String, DateTime<Utc>)>,
}

impl InMemoryPresenceStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX / 1000)),
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn publish_presence(&self, user_id: i64, node_id: &str) -> Result<()> {
        self.entries
            .insert(user_id, (node_id.to_string(), Utc::now() + self.ttl));
        Ok(())
    }

    async fn remove_presence(&self, user_id: i64, node_id: &str) -> Result<()> {
        self.entries.remove_if(&user_id, |_, (node, _)| node == node_id);
        Ok(())
    }

    async fn query_presence(&self, user_id: i64) -> Result<Option<String>> {
        let now = Utc::now();
        let found = self
            .entries
            .get(&user_id)
            .map(|entry| (entry.0.clone(), entry.1));
        match found {
            Some((node, expires_at)) if expires_at > now => Ok(Some(node)),
            Some(_) => {
                self.entries
                    .remove_if(&user_id, |_, (_, expires_at)| *expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// 内存离线队列
pub struct InMemoryOfflineStore {
    retention: Duration,
    entries: DashMap<i64, Vec<ChatMessage>>,
}

impl InMemoryOfflineStore {
    pub fn new(retention_days: u32) -> Self {
        Self {
            retention: Duration::days(i64::from(retention_days)),
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl OfflineStore for InMemoryOfflineStore {
    async fn enqueue(&self, receiver_id: i64, message: &ChatMessage) -> Result<()> {
        let mut queue = self.entries.entry(receiver_id).or_default();
        if !queue.iter().any(|m| m.message_id == message.message_id) {
            queue.push(message.clone());
        }
        Ok(())
    }

    async fn drain(&self, receiver_id: i64) -> Result<Vec<ChatMessage>> {
        let Some((_, mut messages)) = self.entries.remove(&receiver_id) else {
            return Ok(Vec::new());
        };
        let cutoff = Utc::now() - self.retention;
        messages.retain(|m| m.timestamp >= cutoff);
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    async fn pending_count(&self, receiver_id: i64) -> Result<usize> {
        Ok(self.entries.get(&receiver_id).map_or(0, |q| q.len()))
    }
}

/// 内存序列号生成器：每个会话一个原子计数器
pub struct InMemorySequenceGenerator {
    counters: DashMap<String, Arc<AtomicI64>>,
    repository: Option<Arc<dyn MessageRepository>>,
}

impl InMemorySequenceGenerator {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            repository: None,
        }
    }

    /// 首次使用某个会话时，从仓储中的最大序列号继续
    pub fn with_repository(repository: Arc<dyn MessageRepository>) -> Self {
        Self {
            counters: DashMap::new(),
            repository: Some(repository),
        }
    }
}

impl Default for InMemorySequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SequenceGenerator for InMemorySequenceGenerator {
    async fn next_sequence(&self, conversation_id: &str) -> Result<i64> {
        if let Some(counter) = self.counters.get(conversation_id) {
            return Ok(counter.fetch_add(1, Ordering::SeqCst) + 1);
        }

        let floor = match &self.repository {
            Some(repository) => repository.max_sequence(conversation_id).await?,
            None => 0,
        };
        let counter = Arc::clone(
            self.counters
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(AtomicI64::new(floor)))
                .value(),
        );
        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// 内存时间线：按 (时间戳, 序列号) 排序，超出窗口时淘汰最旧的
pub struct InMemoryTimelineIndex {
    window: usize,
    entries: DashMap<String, BTreeMap<(i64, i64), ChatMessage>>,
}

impl InMemoryTimelineIndex {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            entries: DashMap::new(),
        }
    }

    fn sort_key(message: &ChatMessage) -> (i64, i64) {
        (
            message.timestamp.timestamp_millis(),
            message.sequence_number.unwrap_or_default(),
        )
    }
}

#[async_trait]
impl TimelineIndex for InMemoryTimelineIndex {
    async fn append(&self, message: &ChatMessage) -> Result<()> {
        let mut timeline = self
            .entries
            .entry(message.conversation_id.clone())
            .or_default();
        timeline.insert(Self::sort_key(message), message.clone());
        while timeline.len() > self.window {
            timeline.pop_first();
        }
        Ok(())
    }

    async fn latest(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let Some(timeline) = self.entries.get(conversation_id) else {
            return Ok(Vec::new());
        };
        let mut messages: Vec<ChatMessage> =
            timeline.values().rev().take(limit).cloned().collect();
        messages.sort_by_key(|m| (m.sequence_number, m.timestamp));
        Ok(messages)
    }

    async fn replace(&self, conversation_id: &str, messages: &[ChatMessage]) -> Result<()> {
        let mut timeline: BTreeMap<(i64, i64), ChatMessage> = messages
            .iter()
            .map(|m| (Self::sort_key(m), m.clone()))
            .collect();
        while timeline.len() > self.window {
            timeline.pop_first();
        }
        self.entries.insert(conversation_id.to_string(), timeline);
        Ok(())
    }
}

/// 内存消息仓储，按 message_id 去重
#[derive(Default)]
pub struct InMemoryMessageRepository {
    messages: DashMap<i64, ChatMessage>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn conversation(&self, conversation_id: &str) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = self
            .messages
            .iter()
            .filter(|entry| entry.conversation_id == conversation_id)
            .map(|entry| entry.value().clone())
            .collect();
        messages.sort_by_key(|m| m.sequence_number);
        messages
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn save_message(&self, message: &ChatMessage) -> Result<bool> {
        match self.messages.entry(message.message_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(message.clone());
                Ok(true)
            }
        }
    }

    async fn find_message(&self, message_id: i64) -> Result<Option<ChatMessage>> {
        Ok(self.messages.get(&message_id).map(|m| m.clone()))
    }

    async fn mark_read(&self, reader_id: i64, message_ids: &[i64]) -> Result<u64> {
        let mut updated = 0;
        for id in message_ids {
            if let Some(mut message) = self.messages.get_mut(id) {
                let addressed = message.conversation_kind == ConversationKind::Private
                    && message.receiver_id == reader_id;
                if addressed && !message.read {
                    message.read = true;
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn update_delivery_status(&self, message_id: i64, status: DeliveryStatus) -> Result<()> {
        if let Some(mut message) = self.messages.get_mut(&message_id) {
            if message.delivery_status.can_advance_to(status) {
                message.delivery_status = status;
            }
        }
        Ok(())
    }

    async fn max_sequence(&self, conversation_id: &str) -> Result<i64> {
        Ok(self
            .messages
            .iter()
            .filter(|entry| entry.conversation_id == conversation_id)
            .filter_map(|entry| entry.sequence_number)
            .max()
            .unwrap_or(0))
    }

    async fn list_recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let messages = self.conversation(conversation_id);
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::domain::model::{ChatPayload, ContentType};

    fn message(id: i64, sender: i64, receiver: i64) -> ChatMessage {
        ChatMessage::private(
            id,
            sender,
            ChatPayload {
                receiver_id: receiver,
                content_type: ContentType::Text.code(),
                content: format!("m{id}"),
                client_msg_no: None,
                extra: None,
            },
        )
    }

    #[tokio::test]
    async fn presence_removal_requires_matching_node() {
        let store = InMemoryPresenceStore::new(300);
        store.publish_presence(1, "node-a").await.unwrap();
        store.remove_presence(1, "node-b").await.unwrap();
        assert_eq!(store.query_presence(1).await.unwrap().as_deref(), Some("node-a"));
        store.remove_presence(1, "node-a").await.unwrap();
        assert!(store.query_presence(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn presence_expires() {
        let store = InMemoryPresenceStore::new(0);
        store.publish_presence(1, "node-a").await.unwrap();
        assert!(store.query_presence(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn offline_drain_is_ordered_deduplicated_and_destructive() {
        let store = InMemoryOfflineStore::new(7);
        let mut older = message(1, 2, 3);
        older.timestamp = Utc::now() - Duration::minutes(1);
        let newer = message(2, 2, 3);

        store.enqueue(3, &newer).await.unwrap();
        store.enqueue(3, &older).await.unwrap();
        store.enqueue(3, &newer).await.unwrap();
        assert_eq!(store.pending_count(3).await.unwrap(), 2);

        let drained = store.drain(3).await.unwrap();
        assert_eq!(
            drained.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(store.drain(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_drain_discards_expired_entries() {
        let store = InMemoryOfflineStore::new(7);
        let mut stale = message(1, 2, 3);
        stale.timestamp = Utc::now() - Duration::days(8);
        store.enqueue(3, &stale).await.unwrap();
        store.enqueue(3, &message(2, 2, 3)).await.unwrap();

        let drained = store.drain(3).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message_id, 2);
    }

    #[tokio::test]
    async fn sequences_are_gap_free_under_concurrency() {
        let generator = Arc::new(InMemorySequenceGenerator::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let generator = generator.clone();
            tasks.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..100 {
                    seen.push(generator.next_sequence("private_1_2").await.unwrap());
                }
                seen
            }));
        }

        let mut all = HashSet::new();
        for task in tasks {
            for seq in task.await.unwrap() {
                assert!(all.insert(seq));
            }
        }
        assert_eq!(all.len(), 800);
        assert_eq!(all.iter().min(), Some(&1));
        assert_eq!(all.iter().max(), Some(&800));
        assert_eq!(generator.next_sequence("group_9").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sequence_resumes_from_repository() {
        let repository = Arc::new(InMemoryMessageRepository::new());
        let mut stored = message(1, 1, 2);
        stored.sequence_number = Some(41);
        repository.save_message(&stored).await.unwrap();

        let generator = InMemorySequenceGenerator::with_repository(repository);
        assert_eq!(generator.next_sequence("private_1_2").await.unwrap(), 42);
    }

    #[tokio::test]
    async fn timeline_keeps_bounded_window() {
        let timeline = InMemoryTimelineIndex::new(3);
        for seq in 1..=5 {
            let mut m = message(seq, 1, 2);
            m.sequence_number = Some(seq);
            m.timestamp = Utc::now() + Duration::milliseconds(seq);
            timeline.append(&m).await.unwrap();
        }

        let latest = timeline.latest("private_1_2", 10).await.unwrap();
        assert_eq!(
            latest.iter().map(|m| m.sequence_number.unwrap()).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        let latest = timeline.latest("private_1_2", 2).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[1].sequence_number, Some(5));
    }

    #[tokio::test]
    async fn repository_is_idempotent_by_message_id() {
        let repository = InMemoryMessageRepository::new();
        let m = message(7, 1, 2);
        assert!(repository.save_message(&m).await.unwrap());
        assert!(!repository.save_message(&m).await.unwrap());
        assert_eq!(repository.len(), 1);

        // 发送方不能把自己发出的消息标记为已读
        assert_eq!(repository.mark_read(1, &[7]).await.unwrap(), 0);
        assert_eq!(repository.mark_read(2, &[7, 8]).await.unwrap(), 1);
        assert_eq!(repository.mark_read(2, &[7]).await.unwrap(), 0);

        repository
            .update_delivery_status(7, DeliveryStatus::Pushed)
            .await
            .unwrap();
        repository
            .update_delivery_status(7, DeliveryStatus::Sending)
            .await
            .unwrap();
        let stored = repository.find_message(7).await.unwrap().unwrap();
        assert_eq!(stored.delivery_status, DeliveryStatus::Pushed);
        assert!(stored.read);
    }
}
