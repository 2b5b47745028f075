//! # Prometheus 指标收集模块
//!
//! 为网关提供统一的 Prometheus 指标：连接数、收发帧、投递管线与离线队列。

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use tracing::warn;

/// 网关指标
///
/// 每个实例持有独立的注册表，同一进程内的多个网关（测试）互不干扰。
pub struct GatewayMetrics {
    registry: Registry,
    /// 当前活跃连接数
    pub connections_active: IntGauge,
    /// 收到的帧总数（按消息类型）
    pub frames_received_total: IntCounterVec,
    /// 丢弃的帧总数（按原因）
    pub frames_dropped_total: IntCounterVec,
    /// 接收并进入投递管线的消息数（private / group / read_receipt）
    pub messages_accepted_total: IntCounterVec,
    /// MQ 发送失败次数（按 topic）
    pub broker_publish_failure_total: IntCounterVec,
    /// 重试发送次数
    pub retry_attempts_total: IntCounter,
    /// 重试耗尽、标记为失败的消息数
    pub retry_exhausted_total: IntCounter,
    /// 写入离线队列的消息数
    pub offline_enqueued_total: IntCounter,
    /// 上线后补发的离线消息数
    pub offline_replayed_total: IntCounter,
    /// 心跳超时关闭的连接数
    pub heartbeat_timeout_total: IntCounter,
    /// 消息持久化耗时（秒）
    pub persist_duration_seconds: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let connections_active =
            IntGauge::new("im_connections_active", "Number of active connections")
                .expect("Failed to create im_connections_active metric");

        let frames_received_total = IntCounterVec::new(
            Opts::new("im_frames_received_total", "Total number of frames received"),
            &["message_type"],
        )
        .expect("Failed to create im_frames_received_total metric");

        let frames_dropped_total = IntCounterVec::new(
            Opts::new("im_frames_dropped_total", "Total number of frames dropped"),
            &["reason"],
        )
        .expect("Failed to create im_frames_dropped_total metric");

        let messages_accepted_total = IntCounterVec::new(
            Opts::new(
                "im_messages_accepted_total",
                "Total number of messages accepted for delivery",
            ),
            &["kind"],
        )
        .expect("Failed to create im_messages_accepted_total metric");

        let broker_publish_failure_total = IntCounterVec::new(
            Opts::new(
                "im_broker_publish_failure_total",
                "Total number of broker publish failures",
            ),
            &["topic"],
        )
        .expect("Failed to create im_broker_publish_failure_total metric");

        let retry_attempts_total = IntCounter::new(
            "im_retry_attempts_total",
            "Total number of broker publish retries",
        )
        .expect("Failed to create im_retry_attempts_total metric");

        let retry_exhausted_total = IntCounter::new(
            "im_retry_exhausted_total",
            "Total number of messages that exhausted their retry budget",
        )
        .expect("Failed to create im_retry_exhausted_total metric");

        let offline_enqueued_total = IntCounter::new(
            "im_offline_enqueued_total",
            "Total number of messages stored for offline recipients",
        )
        .expect("Failed to create im_offline_enqueued_total metric");

        let offline_replayed_total = IntCounter::new(
            "im_offline_replayed_total",
            "Total number of offline messages replayed on login",
        )
        .expect("Failed to create im_offline_replayed_total metric");

        let heartbeat_timeout_total = IntCounter::new(
            "im_heartbeat_timeout_total",
            "Total number of connections closed by heartbeat timeout",
        )
        .expect("Failed to create im_heartbeat_timeout_total metric");

        let persist_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "im_persist_duration_seconds",
                "Message persistence duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )
        .expect("Failed to create im_persist_duration_seconds metric");

        let registry = Registry::new();
        registry
            .register(Box::new(connections_active.clone()))
            .expect("Failed to register connections_active");
        registry
            .register(Box::new(frames_received_total.clone()))
            .expect("Failed to register frames_received_total");
        registry
            .register(Box::new(frames_dropped_total.clone()))
            .expect("Failed to register frames_dropped_total");
        registry
            .register(Box::new(messages_accepted_total.clone()))
            .expect("Failed to register messages_accepted_total");
        registry
            .register(Box::new(broker_publish_failure_total.clone()))
            .expect("Failed to register broker_publish_failure_total");
        registry
            .register(Box::new(retry_attempts_total.clone()))
            .expect("Failed to register retry_attempts_total");
        registry
            .register(Box::new(retry_exhausted_total.clone()))
            .expect("Failed to register retry_exhausted_total");
        registry
            .register(Box::new(offline_enqueued_total.clone()))
            .expect("Failed to register offline_enqueued_total");
        registry
            .register(Box::new(offline_replayed_total.clone()))
            .expect("Failed to register offline_replayed_total");
        registry
            .register(Box::new(heartbeat_timeout_total.clone()))
            .expect("Failed to register heartbeat_timeout_total");
        registry
            .register(Box::new(persist_duration_seconds.clone()))
            .expect("Failed to register persist_duration_seconds");

        Self {
            registry,
            connections_active,
            frames_received_total,
            frames_dropped_total,
            messages_accepted_total,
            broker_publish_failure_total,
            retry_attempts_total,
            retry_exhausted_total,
            offline_enqueued_total,
            offline_replayed_total,
            heartbeat_timeout_total,
            persist_duration_seconds,
        }
    }
}

impl GatewayMetrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 获取 Prometheus 文本导出格式
    pub fn encode_text(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %err, "failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_text_output() {
        let metrics = GatewayMetrics::new();
        metrics
            .frames_received_total
            .with_label_values(&["CHAT_MESSAGE"])
            .inc();
        metrics.connections_active.inc();

        let text = metrics.encode_text();
        assert!(text.contains("im_frames_received_total{message_type=\"CHAT_MESSAGE\"} 1"));
        assert!(text.contains("im_connections_active 1"));
    }

    #[test]
    fn instances_do_not_share_counters() {
        let first = GatewayMetrics::new();
        let second = GatewayMetrics::new();
        first.offline_enqueued_total.inc();
        first.offline_enqueued_total.inc();

        assert!(first.encode_text().contains("im_offline_enqueued_total 2"));
        assert!(second.encode_text().contains("im_offline_enqueued_total 0"));
        assert!(!second.registry().gather().is_empty());
    }
}
