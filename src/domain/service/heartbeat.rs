//! 心跳状态机
//!
//! 每个连接一个实例：`ALIVE(0)` 在读空闲事件时累加，达到上限进入 `CLOSING`（终态）。
//! 收到心跳请求时回到 `ALIVE(0)`；是否由任意帧重置由策略决定，默认只有心跳重置。
//! 写空闲和读写空闲事件只记录日志，不会关闭连接。

use tracing::debug;

/// 空闲事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdleKind {
    Reader,
    Writer,
    All,
}

impl IdleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reader => "reader_idle",
            Self::Writer => "writer_idle",
            Self::All => "all_idle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Alive(u32),
    Closing,
}

/// 空闲事件处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    KeepOpen,
    Close,
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    max_strikes: u32,
    reset_on_any_frame: bool,
    state: HeartbeatState,
}

impl HeartbeatMonitor {
    pub fn new(max_strikes: u32, reset_on_any_frame: bool) -> Self {
        Self {
            max_strikes: max_strikes.max(1),
            reset_on_any_frame,
            state: HeartbeatState::Alive(0),
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    pub fn strikes(&self) -> u32 {
        match self.state {
            HeartbeatState::Alive(n) => n,
            HeartbeatState::Closing => self.max_strikes,
        }
    }

    pub fn on_idle(&mut self, kind: IdleKind) -> IdleAction {
        match (self.state, kind) {
            (HeartbeatState::Closing, _) => IdleAction::Close,
            (HeartbeatState::Alive(n), IdleKind::Reader) => {
                let strikes = n + 1;
                if strikes >= self.max_strikes {
                    self.state = HeartbeatState::Closing;
                    IdleAction::Close
                } else {
                    self.state = HeartbeatState::Alive(strikes);
                    IdleAction::KeepOpen
                }
            }
            (HeartbeatState::Alive(n), other) => {
                debug!(idle = other.as_str(), strikes = n, "idle event ignored");
                IdleAction::KeepOpen
            }
        }
    }

    pub fn on_heartbeat(&mut self) {
        if let HeartbeatState::Alive(_) = self.state {
            self.state = HeartbeatState::Alive(0);
        }
    }

    /// 非心跳帧，按策略决定是否重置
    pub fn on_frame(&mut self) {
        if self.reset_on_any_frame {
            self.on_heartbeat();
        }
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(3, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closes_after_three_reader_idle_events() {
        let mut monitor = HeartbeatMonitor::default();
        assert_eq!(monitor.on_idle(IdleKind::Reader), IdleAction::KeepOpen);
        assert_eq!(monitor.on_idle(IdleKind::Reader), IdleAction::KeepOpen);
        assert_eq!(monitor.on_idle(IdleKind::Reader), IdleAction::Close);
        assert_eq!(monitor.state(), HeartbeatState::Closing);
    }

    #[test]
    fn heartbeat_resets_strikes() {
        let mut monitor = HeartbeatMonitor::default();
        monitor.on_idle(IdleKind::Reader);
        monitor.on_idle(IdleKind::Reader);
        monitor.on_heartbeat();
        assert_eq!(monitor.state(), HeartbeatState::Alive(0));
        assert_eq!(monitor.on_idle(IdleKind::Reader), IdleAction::KeepOpen);
        assert_eq!(monitor.strikes(), 1);
    }

    #[test]
    fn other_frames_only_reset_when_configured() {
        let mut monitor = HeartbeatMonitor::new(3, false);
        monitor.on_idle(IdleKind::Reader);
        monitor.on_frame();
        assert_eq!(monitor.strikes(), 1);

        let mut monitor = HeartbeatMonitor::new(3, true);
        monitor.on_idle(IdleKind::Reader);
        monitor.on_frame();
        assert_eq!(monitor.strikes(), 0);
    }

    #[test]
    fn writer_and_all_idle_never_close() {
        let mut monitor = HeartbeatMonitor::default();
        for _ in 0..10 {
            assert_eq!(monitor.on_idle(IdleKind::Writer), IdleAction::KeepOpen);
            assert_eq!(monitor.on_idle(IdleKind::All), IdleAction::KeepOpen);
        }
        assert_eq!(monitor.strikes(), 0);
    }

    #[test]
    fn closing_is_terminal() {
        let mut monitor = HeartbeatMonitor::new(1, false);
        assert_eq!(monitor.on_idle(IdleKind::Reader), IdleAction::Close);
        monitor.on_heartbeat();
        assert_eq!(monitor.state(), HeartbeatState::Closing);
    }
}
