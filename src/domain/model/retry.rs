//! 重试票据与重试策略
//!
//! 第 n 次发布失败后等待 `n * step`（默认 step 为 5 分钟），
//! 失败次数达到 `max_attempts` 后不再重试，消息标记为 FAILED。

use chrono::{DateTime, Duration, Utc};

/// 一条发布失败的消息的重试状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTicket {
    pub message_id: i64,
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    /// 已失败的发布次数
    pub attempt_count: u32,
    pub next_eligible_at: DateTime<Utc>,
}

/// 一次失败之后的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(DateTime<Utc>),
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step: Duration::minutes(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, step_secs: u64) -> Self {
        let step_secs = i64::try_from(step_secs).unwrap_or(i64::MAX / 1000);
        Self {
            max_attempts,
            step: Duration::seconds(step_secs),
        }
    }

    /// 根据累计失败次数决定下一步
    pub fn decide(&self, failures: u32, now: DateTime<Utc>) -> RetryDecision {
        if failures >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        RetryDecision::RetryAt(now + self.step * failures as i32)
    }
}

impl RetryTicket {
    pub fn new(
        message_id: i64,
        topic: impl Into<String>,
        key: impl Into<String>,
        payload: Vec<u8>,
        next_eligible_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id,
            topic: topic.into(),
            key: key.into(),
            payload,
            attempt_count: 1,
            next_eligible_at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_schedule_and_cap() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        assert_eq!(
            policy.decide(1, now),
            RetryDecision::RetryAt(now + Duration::minutes(5))
        );
        assert_eq!(
            policy.decide(2, now),
            RetryDecision::RetryAt(now + Duration::minutes(10))
        );
        assert_eq!(policy.decide(3, now), RetryDecision::Exhausted);
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let policy = RetryPolicy::new(1, 60);
        assert_eq!(policy.decide(1, Utc::now()), RetryDecision::Exhausted);
    }
}
