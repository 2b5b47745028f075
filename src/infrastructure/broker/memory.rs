//! 进程内消息队列
//!
//! 单节点部署时替代 Kafka；测试中通过 [`InMemoryBroker::pump`] 同步驱动消费。

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::redelivery_delay;
use crate::domain::repository::{MessageBroker, RecordHandler};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// 默认重新投递等待
const DEFAULT_REDELIVERY_BACKOFF: Duration = Duration::from_millis(200);
const DEFAULT_MAX_REDELIVERY_BACKOFF: Duration = Duration::from_secs(10);

pub struct InMemoryBroker {
    queue: Mutex<VecDeque<BrokerRecord>>,
    notify: Notify,
    published: AtomicU64,
    redelivery_backoff: Duration,
    max_redelivery_backoff: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::with_redelivery_backoff(DEFAULT_REDELIVERY_BACKOFF, DEFAULT_MAX_REDELIVERY_BACKOFF)
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_redelivery_backoff(backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            published: AtomicU64::new(0),
            redelivery_backoff: backoff,
            max_redelivery_backoff: max_backoff.max(backoff),
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// 取出当前积压的全部记录（不交给处理器）
    pub async fn take_pending(&self) -> Vec<BrokerRecord> {
        self.queue.lock().await.drain(..).collect()
    }

    /// 按顺序处理积压记录（包括处理过程中新产生的记录），返回成功处理的条数
    ///
    /// 处理失败的记录放回队首并停止本轮，后续记录不会越过它。
    pub async fn pump(&self, handler: &dyn RecordHandler) -> usize {
        self.pump_until_failure(handler).await.0
    }

    async fn pump_until_failure(&self, handler: &dyn RecordHandler) -> (usize, bool) {
        let mut handled = 0;
        loop {
            let next = self.queue.lock().await.pop_front();
            let Some(record) = next else {
                return (handled, false);
            };
            match handler.handle_record(&record.topic, &record.payload).await {
                Ok(()) => handled += 1,
                Err(err) => {
                    error!(
                        topic = %record.topic,
                        key = %record.key,
                        error = %err,
                        "failed to handle record, kept for redelivery"
                    );
                    self.queue.lock().await.push_front(record);
                    return (handled, true);
                }
            }
        }
    }

    pub async fn run(&self, handler: Arc<dyn RecordHandler>, shutdown: CancellationToken) {
        info!("in-memory broker consumer started");
        let mut failures = 0u32;
        loop {
            let notified = self.notify.notified();
            let (_, stalled) = self.pump_until_failure(handler.as_ref()).await;
            if stalled {
                failures = failures.saturating_add(1);
                let delay =
                    redelivery_delay(self.redelivery_backoff, self.max_redelivery_backoff, failures);
                warn!(
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "record redelivery scheduled"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
            failures = 0;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = notified => {}
            }
        }
        info!("in-memory broker consumer stopped");
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        self.queue.lock().await.push_back(BrokerRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_vec(),
        });
        self.published.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(())
    }
}
