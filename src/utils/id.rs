//! 消息 ID
//!
//! - 服务端生成：毫秒时间戳左移 16 位 + 进程内计数器
//! - 客户端 ID 冲突时：按 (发送方, 客户端 ID) 确定性派生，同一发送方重发得到同一个 ID

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

const COUNTER_BITS: u32 = 16;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// 生成服务端发起的帧使用的消息 ID（正数）
pub fn next_server_message_id() -> i64 {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;
    ((millis << COUNTER_BITS) | seq) as i64 & i64::MAX
}

/// 按发送方派生消息 ID（正数），不同发送方使用同一个客户端 ID 时互不覆盖
pub fn scoped_message_id(sender_id: i64, client_id: i64) -> i64 {
    let mut x = (sender_id as u64).rotate_left(32) ^ (client_id as u64);
    // splitmix64
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    match (x & i64::MAX as u64) as i64 {
        0 => 1,
        id => id,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ids_are_unique_and_positive() {
        let ids: HashSet<i64> = (0..10_000).map(|_| next_server_message_id()).collect();
        assert_eq!(ids.len(), 10_000);
        assert!(ids.iter().all(|id| *id > 0));
    }

    #[test]
    fn scoped_ids_depend_on_sender() {
        let alice = scoped_message_id(1, 1001);
        let bob = scoped_message_id(2, 1001);
        assert_ne!(alice, bob);
        assert_eq!(alice, scoped_message_id(1, 1001));
        assert!(alice > 0 && bob > 0);
        assert_ne!(alice, 1001);
    }
}
