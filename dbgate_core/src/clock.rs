//! 时钟抽象
//!
//! 滑动窗口、冷却时间和排队截止时间都通过 [`Clock`] 读取当前时间，
//! 测试中可以用 [`ManualClock`] 精确推进。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 毫秒精度的时钟
pub trait Clock: Send + Sync + fmt::Debug {
    /// 当前时间（UNIX 纪元毫秒）
    fn now_ms(&self) -> u64;
}

/// 共享时钟句柄
pub type SharedClock = Arc<dyn Clock>;

/// 系统墙上时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// 创建系统时钟句柄
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// 手动推进的时钟
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// 以指定时间创建
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    /// 设置当前时间
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// 向前推进
    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl fmt::Display for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManualClock({}ms)", self.now_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_recent() {
        // 2020-01-01 之后
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);

        clock.advance(250);
        assert_eq!(clock.now_ms(), 1_250);

        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_shared_clock() {
        let manual = Arc::new(ManualClock::new(5));
        let shared: SharedClock = manual.clone();
        manual.advance(5);
        assert_eq!(shared.now_ms(), 10);
    }
}
