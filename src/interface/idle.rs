//! 连接空闲计时
//!
//! 读空闲、写空闲、读写空闲三个独立截止时间；任一读写都会重新计时对应项，
//! 触发后从触发时刻重新开始计时。时长为零表示禁用该项。

use std::time::Duration;

use tokio::time::Instant;

use crate::config::HeartbeatConfig;
use crate::domain::service::IdleKind;

#[derive(Debug, Clone)]
pub struct IdleTimer {
    reader_idle: Option<Duration>,
    writer_idle: Option<Duration>,
    all_idle: Option<Duration>,
    reader_deadline: Option<Instant>,
    writer_deadline: Option<Instant>,
    all_deadline: Option<Instant>,
}

fn enabled(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl IdleTimer {
    pub fn new(
        reader_idle: Option<Duration>,
        writer_idle: Option<Duration>,
        all_idle: Option<Duration>,
        now: Instant,
    ) -> Self {
        Self {
            reader_idle,
            writer_idle,
            all_idle,
            reader_deadline: reader_idle.map(|d| now + d),
            writer_deadline: writer_idle.map(|d| now + d),
            all_deadline: all_idle.map(|d| now + d),
        }
    }

    pub fn from_config(config: &HeartbeatConfig, now: Instant) -> Self {
        Self::new(
            enabled(config.reader_idle_secs),
            enabled(config.writer_idle_secs),
            enabled(config.all_idle_secs),
            now,
        )
    }

    pub fn on_read(&mut self, now: Instant) {
        self.reader_deadline = self.reader_idle.map(|d| now + d);
        self.all_deadline = self.all_idle.map(|d| now + d);
    }

    pub fn on_write(&mut self, now: Instant) {
        self.writer_deadline = self.writer_idle.map(|d| now + d);
        self.all_deadline = self.all_idle.map(|d| now + d);
    }

    /// 最近的截止时间，全部禁用时为 None
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.reader_deadline, self.writer_deadline, self.all_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// 返回已到期的空闲事件，并重新计时
    pub fn fire(&mut self, now: Instant) -> Vec<IdleKind> {
        let mut fired = Vec::new();
        if expire(&mut self.reader_deadline, self.reader_idle, now) {
            fired.push(IdleKind::Reader);
        }
        if expire(&mut self.writer_deadline, self.writer_idle, now) {
            fired.push(IdleKind::Writer);
        }
        if expire(&mut self.all_deadline, self.all_idle, now) {
            fired.push(IdleKind::All);
        }
        fired
    }
}

fn expire(deadline: &mut Option<Instant>, period: Option<Duration>, now: Instant) -> bool {
    match (*deadline, period) {
        (Some(at), Some(period)) if at <= now => {
            *deadline = Some(now + period);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn reads_push_reader_deadline_back() {
        let start = Instant::now();
        let mut timer = IdleTimer::new(Some(secs(60)), None, None, start);
        assert_eq!(timer.next_deadline(), Some(start + secs(60)));

        timer.on_read(start + secs(50));
        assert!(timer.fire(start + secs(60)).is_empty());
        assert_eq!(timer.fire(start + secs(110)), vec![IdleKind::Reader]);
        // 触发后从触发时刻重新计时
        assert_eq!(timer.next_deadline(), Some(start + secs(170)));
    }

    #[test]
    fn writes_reset_writer_and_all_only() {
        let start = Instant::now();
        let mut timer = IdleTimer::new(Some(secs(60)), Some(secs(30)), Some(secs(90)), start);
        timer.on_write(start + secs(20));

        let fired = timer.fire(start + secs(60));
        assert_eq!(fired, vec![IdleKind::Reader, IdleKind::Writer]);
        assert_eq!(timer.next_deadline(), Some(start + secs(90)));
        assert_eq!(timer.fire(start + secs(110)), vec![IdleKind::Writer, IdleKind::All]);
    }

    #[test]
    fn disabled_timers_never_fire() {
        let config = HeartbeatConfig {
            reader_idle_secs: 0,
            writer_idle_secs: 0,
            all_idle_secs: 0,
            ..HeartbeatConfig::default()
        };
        let start = Instant::now();
        let mut timer = IdleTimer::from_config(&config, start);
        assert_eq!(timer.next_deadline(), None);
        assert!(timer.fire(start + secs(3600)).is_empty());
    }
}
