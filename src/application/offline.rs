//! 离线消息补发
//!
//! 用户认证成功后触发。同一用户的补发通过用户级锁串行化，离线队列本身的 drain 是原子的。

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::repository::{OfflineStore, SessionLookup};
use crate::error::Result;
use crate::metrics::GatewayMetrics;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub delivered: usize,
    pub requeued: usize,
}

pub struct OfflineReplayService {
    offline: Arc<dyn OfflineStore>,
    sessions: Arc<dyn SessionLookup>,
    metrics: Arc<GatewayMetrics>,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl OfflineReplayService {
    pub fn new(
        offline: Arc<dyn OfflineStore>,
        sessions: Arc<dyn SessionLookup>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            offline,
            sessions,
            metrics,
            locks: DashMap::new(),
        }
    }

    pub async fn replay(&self, user_id: i64) -> Result<ReplayReport> {
        let lock = self
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.replay_locked(user_id).await
        };

        // 没有其他补发在等待时回收锁
        self.locks
            .remove_if(&user_id, |_, entry| Arc::strong_count(entry) <= 2);
        result
    }

    async fn replay_locked(&self, user_id: i64) -> Result<ReplayReport> {
        let pending = self.offline.drain(user_id).await?;
        if pending.is_empty() {
            debug!(user_id, "no offline messages");
            return Ok(ReplayReport::default());
        }

        let mut report = ReplayReport::default();
        let mut remaining = pending.into_iter();
        for message in remaining.by_ref() {
            let frame = match message.to_push_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(
                        user_id,
                        message_id = message.message_id,
                        error = %err,
                        "offline message not encodable, dropped"
                    );
                    continue;
                }
            };
            if self.sessions.send_to_user(user_id, frame) {
                report.delivered += 1;
                self.metrics.offline_replayed_total.inc();
            } else {
                // 连接在补发途中消失，余下消息放回队列
                self.offline.enqueue(user_id, &message).await?;
                report.requeued += 1;
                break;
            }
        }
        for message in remaining {
            self.offline.enqueue(user_id, &message).await?;
            report.requeued += 1;
        }

        info!(
            user_id,
            delivered = report.delivered,
            requeued = report.requeued,
            "offline replay finished"
        );
        Ok(report)
    }
}
