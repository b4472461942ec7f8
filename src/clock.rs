//! 时钟抽象
//!
//! 统计窗口和预热按毫秒计算，匀速排队按纳秒计算。生产环境使用 [`SystemClock`]，
//! 测试使用 [`ManualClock`] 手动推进时间。

use crate::constants::NANOS_PER_MILLI;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 时钟
pub trait Clock: Send + Sync + fmt::Debug {
    /// 当前时间（Unix 毫秒）
    fn now_millis(&self) -> u64;

    /// 当前时间（Unix 纳秒），与 `now_millis` 同源
    fn now_nanos(&self) -> u64 {
        self.now_millis().saturating_mul(NANOS_PER_MILLI)
    }
}

/// 系统墙上时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.now_nanos() / NANOS_PER_MILLI
    }

    fn now_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// 手动时钟
///
/// # 示例
/// ```rust
/// use flowsentry::clock::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new(1_000);
/// clock.advance(Duration::from_millis(250));
/// assert_eq!(clock.now_millis(), 1_250);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    /// 纳秒
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis.saturating_mul(NANOS_PER_MILLI)),
        }
    }

    /// 推进时间，精度到纳秒
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }

    /// 设置绝对时间
    pub fn set_millis(&self, millis: u64) {
        self.now
            .store(millis.saturating_mul(NANOS_PER_MILLI), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_nanos() / NANOS_PER_MILLI
    }

    fn now_nanos(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
