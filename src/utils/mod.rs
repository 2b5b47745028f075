//! 工具函数模块
//!
//! 提供后台任务执行器、服务端消息 ID 生成以及时间戳转换

pub mod executor;
pub mod id;

pub use executor::BackgroundExecutor;
pub use id::{next_server_message_id, scoped_message_id};

use chrono::{DateTime, TimeZone, Utc};

/// 毫秒数转换为 DateTime
pub fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// 当前时间的毫秒数
pub fn current_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip() {
        let dt = millis_to_datetime(1_700_000_000_123).unwrap();
        assert_eq!(dt.timestamp_millis(), 1_700_000_000_123);
        assert!(current_millis() > 1_700_000_000_000);
    }
}
