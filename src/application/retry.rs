//! 发布失败的重试票据存储

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::{Entry, OccupiedEntry};

use crate::domain::model::{RetryDecision, RetryPolicy, RetryTicket};

pub struct RetryTracker {
    policy: RetryPolicy,
    tickets: DashMap<i64, RetryTicket>,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            tickets: DashMap::new(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// 记录一次首发失败；同一消息已有票据时按再次失败处理
    pub fn record_failure(
        &self,
        message_id: i64,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        match self.tickets.entry(message_id) {
            Entry::Occupied(entry) => {
                let failures = entry.get().attempt_count + 1;
                self.apply(entry, failures, now)
            }
            Entry::Vacant(slot) => {
                let decision = self.policy.decide(1, now);
                if let RetryDecision::RetryAt(at) = decision {
                    slot.insert(RetryTicket::new(message_id, topic, key, payload, at));
                }
                decision
            }
        }
    }

    /// 记录一次重试失败；票据已被移除（例如客户端已确认）时返回 None
    pub fn record_retry_failure(
        &self,
        message_id: i64,
        now: DateTime<Utc>,
    ) -> Option<RetryDecision> {
        match self.tickets.entry(message_id) {
            Entry::Occupied(entry) => {
                let failures = entry.get().attempt_count + 1;
                Some(self.apply(entry, failures, now))
            }
            Entry::Vacant(_) => None,
        }
    }

    fn apply(
        &self,
        mut entry: OccupiedEntry<'_, i64, RetryTicket>,
        failures: u32,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        let decision = self.policy.decide(failures, now);
        match decision {
            RetryDecision::RetryAt(at) => {
                let ticket = entry.get_mut();
                ticket.attempt_count = failures;
                ticket.next_eligible_at = at;
            }
            RetryDecision::Exhausted => {
                entry.remove();
            }
        }
        decision
    }

    /// 到期的票据（按下次可执行时间排序）
    pub fn due(&self, now: DateTime<Utc>) -> Vec<RetryTicket> {
        let mut due: Vec<RetryTicket> = self
            .tickets
            .iter()
            .filter(|entry| entry.is_due(now))
            .map(|entry| entry.value().clone())
            .collect();
        due.sort_by_key(|ticket| ticket.next_eligible_at);
        due
    }

    pub fn remove(&self, message_id: i64) -> bool {
        self.tickets.remove(&message_id).is_some()
    }

    pub fn ticket(&self, message_id: i64) -> Option<RetryTicket> {
        self.tickets.get(&message_id).map(|t| t.clone())
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn tickets_follow_schedule_until_exhausted() {
        let tracker = RetryTracker::new(RetryPolicy::default());
        let t0 = Utc::now();

        let decision = tracker.record_failure(1, "topic", "key", b"x".to_vec(), t0);
        assert_eq!(decision, RetryDecision::RetryAt(t0 + Duration::minutes(5)));
        assert!(tracker.due(t0).is_empty());

        let t1 = t0 + Duration::minutes(5);
        assert_eq!(tracker.due(t1).len(), 1);
        let decision = tracker.record_retry_failure(1, t1);
        assert_eq!(
            decision,
            Some(RetryDecision::RetryAt(t1 + Duration::minutes(10)))
        );
        assert_eq!(tracker.ticket(1).unwrap().attempt_count, 2);

        let t2 = t1 + Duration::minutes(10);
        assert_eq!(
            tracker.record_retry_failure(1, t2),
            Some(RetryDecision::Exhausted)
        );
        assert!(tracker.is_empty());
        assert_eq!(tracker.record_retry_failure(1, t2), None);
    }

    #[test]
    fn removed_ticket_is_not_recreated_by_retry_failure() {
        let tracker = RetryTracker::new(RetryPolicy::default());
        let now = Utc::now();
        tracker.record_failure(5, "topic", "key", Vec::new(), now);
        assert!(tracker.remove(5));
        assert_eq!(tracker.record_retry_failure(5, now), None);
        assert!(tracker.is_empty());
    }
}
