//! 消息队列适配器
//!
//! 消费端处理失败的记录不会被跳过：内存队列放回队首，Kafka 原地重试且不提交 offset，
//! 直到处理成功或停机。

use std::time::Duration;

pub mod kafka;
pub mod memory;

pub use kafka::{KafkaMessageBroker, KafkaRecordConsumer};
pub use memory::{BrokerRecord, InMemoryBroker};

/// 第 `failures` 次处理失败后的等待时间：`base * failures`，不超过 `max`
pub fn redelivery_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    base.saturating_mul(failures.max(1)).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redelivery_delay_grows_linearly_up_to_cap() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(2);
        assert_eq!(redelivery_delay(base, max, 0), base);
        assert_eq!(redelivery_delay(base, max, 1), base);
        assert_eq!(redelivery_delay(base, max, 3), Duration::from_millis(1500));
        assert_eq!(redelivery_delay(base, max, 10), max);
    }
}
