//! 有界后台任务执行器
//!
//! 离线补发、MQ 发布、在线状态同步等后台任务都通过这里提交：
//! 并发数受信号量限制，关闭时通过 `CancellationToken` 统一取消。

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone)]
pub struct BackgroundExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    idle: Notify,
    cancel: CancellationToken,
}

impl BackgroundExecutor {
    pub fn new(concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                permits: Arc::new(Semaphore::new(concurrency.max(1))),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                cancel,
            }),
        }
    }

    /// 提交后台任务，立即返回
    ///
    /// 任务在获得许可后才开始执行；执行器关闭后排队中的任务直接丢弃。
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        inner.in_flight.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            let permit = tokio::select! {
                _ = inner.cancel.cancelled() => None,
                permit = Arc::clone(&inner.permits).acquire_owned() => permit.ok(),
            };

            if let Some(_permit) = permit {
                tokio::select! {
                    _ = inner.cancel.cancelled() => {
                        debug!(task = name, "background task cancelled");
                    }
                    _ = task => {}
                }
            } else {
                debug!(task = name, "background task dropped before start");
            }

            if inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                inner.idle.notify_waiters();
            }
        });
    }

    /// 当前未完成的任务数
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// 等待所有已提交的任务完成
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}
