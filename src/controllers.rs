//! 流控控制器模块
//!
//! 每条规则在加载时构建一个控制器，控制器根据资源的实时统计决定请求能否通过。
//!
//! | 阈值类型 | 流控效果 | 控制器 |
//! |---|---|---|
//! | QPS | Reject | [`QpsController`] |
//! | Concurrency | Reject | [`ConcurrencyController`] |
//! | QPS | WarmUp | [`WarmUpController`] |
//! | QPS | RateLimiter | [`RateLimiterController`] |
//! | QPS | WarmUpRateLimiter | [`RateLimiterController`]（速率取自预热曲线） |
//!
//! 排队类控制器通过时返回 [`Admission::Reserved`]，携带需要等待的时长和
//! 放弃时用于归还的预留；其他控制器只返回通过或拒绝。

use crate::constants::NANOS_PER_MILLI;
use crate::error::BlockKind;
use crate::rule::{ControlBehavior, FlowRule, Grade};
use crate::statistics::ResourceNode;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// 控制器判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// 立即通过
    Pass,
    /// 占用了排队位置，等待 [`Reservation::wait`] 后通过
    Reserved(Reservation),
    /// 拒绝
    Block,
}

/// 排队预留
///
/// 请求最终未被放行时（后续规则拒绝或异步等待被取消），
/// 入口把它交回 [`TrafficController::abandon`]。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    wait: Duration,
    slot: Slot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// 队列已空，最后通过时间从 `previous` 移到了 `taken`
    Moved { previous: i64, taken: i64 },
    /// 在队尾追加了 `cost` 纳秒
    Appended { cost: i64 },
}

impl Reservation {
    /// 放行前需要等待的时长，可能为零
    pub fn wait(&self) -> Duration {
        self.wait
    }
}

/// 流控控制器
pub trait TrafficController: Send + Sync + fmt::Debug {
    /// 判断权重为 `weight` 的请求能否通过
    ///
    /// # 参数
    /// - `node`: 规则所统计的资源节点（Relate 策略时为关联资源）
    /// - `weight`: 请求权重
    /// - `now_nanos`: 当前时间（纳秒）
    fn check(&self, node: &ResourceNode, weight: u64, now_nanos: u64) -> Admission;

    /// 归还 `check` 返回的预留
    fn abandon(&self, _reservation: &Reservation) {}

    /// 拒绝类型
    fn block_kind(&self) -> BlockKind;
}

/// 根据规则构建控制器
///
/// 调用前规则必须已通过 [`FlowRule::validate`]。
pub fn build_controller(rule: &FlowRule) -> Arc<dyn TrafficController> {
    match (rule.grade, rule.control_behavior) {
        (Grade::Concurrency, _) => Arc::new(ConcurrencyController::new(rule.threshold)),
        (Grade::Qps, ControlBehavior::Reject) => Arc::new(QpsController::new(rule.threshold)),
        (Grade::Qps, ControlBehavior::WarmUp) => Arc::new(WarmUpController::new(
            WarmUpRamp::from_rule(rule),
        )),
        (Grade::Qps, ControlBehavior::RateLimiter) => Arc::new(RateLimiterController::new(
            RateSource::Fixed(rule.threshold),
            rule.max_queueing_time(),
        )),
        (Grade::Qps, ControlBehavior::WarmUpRateLimiter) => Arc::new(RateLimiterController::new(
            RateSource::WarmUp(WarmUpRamp::from_rule(rule)),
            rule.max_queueing_time(),
        )),
    }
}

// ============================================================================
// QPS 直接拒绝
// ============================================================================

/// QPS 直接拒绝控制器
///
/// `pass_qps + weight <= threshold` 时通过，阈值是包含本次请求在内的上界。
#[derive(Debug)]
pub struct QpsController {
    threshold: f64,
}

impl QpsController {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl TrafficController for QpsController {
    fn check(&self, node: &ResourceNode, weight: u64, _now_nanos: u64) -> Admission {
        let current = node.pass_qps();
        if current + weight as f64 <= self.threshold {
            Admission::Pass
        } else {
            trace!(
                "QPS 超限: resource={}, current={}, threshold={}",
                node.name(),
                current,
                self.threshold
            );
            Admission::Block
        }
    }

    fn block_kind(&self) -> BlockKind {
        BlockKind::Qps
    }
}

// ============================================================================
// 并发数直接拒绝
// ============================================================================

/// 并发数控制器
///
/// `in_flight + weight <= threshold` 时通过。入口在提交时还会用 CAS
/// 再次占用并发数，保证并发竞争下也不会越过阈值。
#[derive(Debug)]
pub struct ConcurrencyController {
    threshold: f64,
}

impl ConcurrencyController {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// 整数形式的并发上限
    pub fn cap(&self) -> u64 {
        self.threshold.floor() as u64
    }
}

impl TrafficController for ConcurrencyController {
    fn check(&self, node: &ResourceNode, weight: u64, _now_nanos: u64) -> Admission {
        if node.in_flight().saturating_add(weight) as f64 <= self.threshold {
            Admission::Pass
        } else {
            Admission::Block
        }
    }

    fn block_kind(&self) -> BlockKind {
        BlockKind::Concurrency
    }
}

// ============================================================================
// 预热
// ============================================================================

const RAMP_UNSET: u64 = u64::MAX;

/// 预热曲线
///
/// 生效阈值在 `warm_up_period` 内从 `threshold / cold_factor` 线性升到
/// `threshold`。通过 QPS 持续不高于 `idle_qps` 超过一个预热周期后重新冷启动。
#[derive(Debug)]
pub struct WarmUpRamp {
    threshold: f64,
    cold_factor: f64,
    warm_up_ms: u64,
    idle_qps: f64,
    /// 本轮预热开始时间
    ramp_start: AtomicU64,
    /// 最后一次观察到非空闲流量的时间
    last_busy: AtomicU64,
}

impl WarmUpRamp {
    pub fn new(threshold: f64, cold_factor: f64, warm_up_period: Duration, idle_qps: f64) -> Self {
        Self {
            threshold,
            cold_factor,
            warm_up_ms: u64::try_from(warm_up_period.as_millis())
                .unwrap_or(u64::MAX)
                .max(1),
            idle_qps,
            ramp_start: AtomicU64::new(RAMP_UNSET),
            last_busy: AtomicU64::new(RAMP_UNSET),
        }
    }

    fn from_rule(rule: &FlowRule) -> Self {
        Self::new(
            rule.threshold,
            rule.cold_factor,
            rule.warm_up_period(),
            rule.idle_qps,
        )
    }

    /// 冷启动阈值
    pub fn cold_threshold(&self) -> f64 {
        self.threshold / self.cold_factor
    }

    /// 观察一次流量并返回当前生效阈值
    pub fn effective_threshold(&self, node: &ResourceNode, now_ms: u64) -> f64 {
        let observed = node.pass_qps();
        let last_busy = self.last_busy.load(Ordering::Acquire);

        if observed > self.idle_qps {
            self.last_busy.store(now_ms, Ordering::Release);
        } else if last_busy == RAMP_UNSET || now_ms.saturating_sub(last_busy) > self.warm_up_ms {
            // 空闲超过一个预热周期，重新冷启动
            if self
                .last_busy
                .compare_exchange(last_busy, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.ramp_start.store(now_ms, Ordering::Release);
                trace!("预热重新开始: resource={}, now={}", node.name(), now_ms);
            }
        }

        let mut start = self.ramp_start.load(Ordering::Acquire);
        if start == RAMP_UNSET {
            // 加载规则时资源已有流量
            start = match self.ramp_start.compare_exchange(
                RAMP_UNSET,
                now_ms,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => now_ms,
                Err(actual) => actual,
            };
        }
        let elapsed = now_ms.saturating_sub(start).min(self.warm_up_ms);
        let progress = elapsed as f64 / self.warm_up_ms as f64;
        let cold = self.cold_threshold();
        cold + (self.threshold - cold) * progress
    }
}

/// 预热控制器
#[derive(Debug)]
pub struct WarmUpController {
    ramp: WarmUpRamp,
}

impl WarmUpController {
    pub fn new(ramp: WarmUpRamp) -> Self {
        Self { ramp }
    }
}

impl TrafficController for WarmUpController {
    fn check(&self, node: &ResourceNode, weight: u64, now_nanos: u64) -> Admission {
        let allowed = self
            .ramp
            .effective_threshold(node, now_nanos / NANOS_PER_MILLI);
        if node.pass_qps() + weight as f64 <= allowed {
            Admission::Pass
        } else {
            trace!(
                "预热阈值不足: resource={}, allowed={:.2}",
                node.name(),
                allowed
            );
            Admission::Block
        }
    }

    fn block_kind(&self) -> BlockKind {
        BlockKind::WarmUp
    }
}

// ============================================================================
// 匀速排队
// ============================================================================

/// 排队速率来源
#[derive(Debug)]
pub enum RateSource {
    /// 固定 QPS
    Fixed(f64),
    /// 跟随预热曲线
    WarmUp(WarmUpRamp),
}

impl RateSource {
    fn rate(&self, node: &ResourceNode, now_ms: u64) -> f64 {
        match self {
            RateSource::Fixed(qps) => *qps,
            RateSource::WarmUp(ramp) => ramp.effective_threshold(node, now_ms),
        }
    }
}

const NEVER_PASSED: i64 = i64::MIN;

/// 匀速排队控制器
///
/// 相邻请求间隔 `weight / rate` 秒，按纳秒计算。需要等待的时长超过最大排队时间时拒绝，
/// 否则返回 [`Admission::Reserved`]，由入口挂起调用方。
///
/// # 特性
/// - 使用 AtomicI64 记录最后一个已预留的通过时间
/// - 队列为空时用 CAS 占位，排队时用 fetch_add 追加
/// - 每个预留记录自己占用的间隔，放弃时只归还自己的部分
#[derive(Debug)]
pub struct RateLimiterController {
    rate: RateSource,
    max_queueing_nanos: i64,
    latest_passed: AtomicI64,
}

impl RateLimiterController {
    pub fn new(rate: RateSource, max_queueing_time: Duration) -> Self {
        Self {
            rate,
            max_queueing_nanos: i64::try_from(max_queueing_time.as_nanos()).unwrap_or(i64::MAX),
            latest_passed: AtomicI64::new(NEVER_PASSED),
        }
    }

    fn cost_nanos(weight: u64, rate: f64) -> i64 {
        (weight as f64 / rate * 1_000_000_000.0).round() as i64
    }
}

impl TrafficController for RateLimiterController {
    fn check(&self, node: &ResourceNode, weight: u64, now_nanos: u64) -> Admission {
        let rate = self.rate.rate(node, now_nanos / NANOS_PER_MILLI);
        if rate <= 0.0 {
            return Admission::Block;
        }

        let now = i64::try_from(now_nanos).unwrap_or(i64::MAX);
        let cost = Self::cost_nanos(weight, rate);

        loop {
            let latest = self.latest_passed.load(Ordering::Acquire);
            if latest == NEVER_PASSED || latest.saturating_add(cost) <= now {
                // 距上次通过已足够久，直接通过
                if self
                    .latest_passed
                    .compare_exchange(latest, now, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Admission::Reserved(Reservation {
                        wait: Duration::ZERO,
                        slot: Slot::Moved {
                            previous: latest,
                            taken: now,
                        },
                    });
                }
                continue;
            }

            let expected_wait = latest.saturating_add(cost).saturating_sub(now);
            if expected_wait > self.max_queueing_nanos {
                return Admission::Block;
            }

            let reserved = self
                .latest_passed
                .fetch_add(cost, Ordering::AcqRel)
                .saturating_add(cost);
            let wait = reserved.saturating_sub(now);
            if wait > self.max_queueing_nanos {
                self.latest_passed.fetch_sub(cost, Ordering::AcqRel);
                return Admission::Block;
            }

            return Admission::Reserved(Reservation {
                wait: Duration::from_nanos(u64::try_from(wait).unwrap_or(0)),
                slot: Slot::Appended { cost },
            });
        }
    }

    fn abandon(&self, reservation: &Reservation) {
        match reservation.slot {
            Slot::Appended { cost } => {
                self.latest_passed.fetch_sub(cost, Ordering::AcqRel);
            }
            Slot::Moved { previous, taken } => {
                // 已有请求排在后面时保留占位
                let _ = self.latest_passed.compare_exchange(
                    taken,
                    previous,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
    }

    fn block_kind(&self) -> BlockKind {
        BlockKind::QueueTimeout
    }
}

// ============================================================================
// 单元测试
// ============================================================================
