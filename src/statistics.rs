//! 资源统计模块
//!
//! 每个资源一个 [`ResourceNode`]，内部使用两个滑动窗口：
//!
//! - 秒级窗口：`sample_count` 个子桶覆盖 `interval_ms`，用于流控判断
//! - 分钟级窗口：60 个一秒桶，用于指标导出
//!
//! # 特性
//! - 每个子桶的计数使用 AtomicU64，写入无锁
//! - 过期子桶在访问时惰性重置，重置使用 try_lock，不阻塞写入方
//! - 并发数计数独立于时间窗口，永不为负

use crate::clock::Clock;
use crate::constants::{MINUTE_INTERVAL_MS, MINUTE_SAMPLE_COUNT};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// 子桶
// ============================================================================

/// 子桶中的计数项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MetricEvent {
    Pass = 0,
    Block = 1,
    Exception = 2,
    Complete = 3,
    /// 响应时间总和（纳秒）
    RtNanos = 4,
}

const EVENT_COUNT: usize = 5;

/// 一个子桶的计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BucketCounts {
    pub pass: u64,
    pub block: u64,
    pub exception: u64,
    pub complete: u64,
    pub rt_nanos: u64,
}

impl BucketCounts {
    fn merge(&mut self, other: &BucketCounts) {
        self.pass += other.pass;
        self.block += other.block;
        self.exception += other.exception;
        self.complete += other.complete;
        self.rt_nanos += other.rt_nanos;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pass == 0 && self.block == 0 && self.complete == 0 && self.exception == 0
    }
}

struct Bucket {
    /// 子桶起始时间（毫秒）
    start: AtomicU64,
    counters: [AtomicU64; EVENT_COUNT],
}

impl Bucket {
    fn new() -> Self {
        Self {
            start: AtomicU64::new(0),
            counters: Default::default(),
        }
    }

    fn add(&self, event: MetricEvent, n: u64) {
        self.counters[event as usize].fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self, event: MetricEvent) -> u64 {
        self.counters[event as usize].load(Ordering::Relaxed)
    }

    fn counts(&self) -> BucketCounts {
        BucketCounts {
            pass: self.get(MetricEvent::Pass),
            block: self.get(MetricEvent::Block),
            exception: self.get(MetricEvent::Exception),
            complete: self.get(MetricEvent::Complete),
            rt_nanos: self.get(MetricEvent::RtNanos),
        }
    }

    fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// 滑动窗口
// ============================================================================

/// 环形子桶数组实现的滑动窗口
///
/// 读取时只统计 `now - start < interval_ms` 的子桶，因此计数随时间连续滚出，
/// 而不是在整秒边界清零。误差不超过一个子桶长度。
pub(crate) struct SlidingWindow {
    bucket_len_ms: u64,
    interval_ms: u64,
    buckets: Box<[Bucket]>,
    rotate_lock: Mutex<()>,
}

impl SlidingWindow {
    /// `interval_ms` 必须能被 `sample_count` 整除（由配置校验保证）
    pub(crate) fn new(sample_count: u32, interval_ms: u64) -> Self {
        let sample_count = sample_count.max(1);
        let buckets = (0..sample_count).map(|_| Bucket::new()).collect();
        Self {
            bucket_len_ms: (interval_ms / u64::from(sample_count)).max(1),
            interval_ms,
            buckets,
            rotate_lock: Mutex::new(()),
        }
    }

    pub(crate) fn interval_secs(&self) -> f64 {
        self.interval_ms as f64 / 1000.0
    }

    fn window_start(&self, now: u64) -> u64 {
        now - now % self.bucket_len_ms
    }

    fn index(&self, now: u64) -> usize {
        ((now / self.bucket_len_ms) % self.buckets.len() as u64) as usize
    }

    /// 获取当前时间对应的子桶，必要时重置过期子桶
    fn current(&self, now: u64) -> &Bucket {
        let bucket = &self.buckets[self.index(now)];
        let window_start = self.window_start(now);

        loop {
            let start = bucket.start.load(Ordering::Acquire);
            // 时钟回拨时直接写入当前子桶
            if start >= window_start {
                return bucket;
            }

            if let Some(_guard) = self.rotate_lock.try_lock() {
                if bucket.start.load(Ordering::Acquire) == start {
                    bucket.reset();
                    bucket.start.store(window_start, Ordering::Release);
                }
                return bucket;
            }
            std::thread::yield_now();
        }
    }

    fn is_live(&self, bucket_start: u64, now: u64) -> bool {
        bucket_start <= now && now - bucket_start < self.interval_ms
    }

    pub(crate) fn add(&self, now: u64, event: MetricEvent, n: u64) {
        self.current(now).add(event, n);
    }

    /// 窗口内所有有效子桶的计数之和
    pub(crate) fn sum(&self, now: u64) -> BucketCounts {
        let mut total = BucketCounts::default();
        for bucket in self.buckets.iter() {
            let start = bucket.start.load(Ordering::Acquire);
            if self.is_live(start, now) {
                total.merge(&bucket.counts());
            }
        }
        total
    }

    /// 起始时间晚于 `since_ms` 且已经结束的有效子桶，按时间升序
    pub(crate) fn completed_since(&self, since_ms: u64, now: u64) -> Vec<(u64, BucketCounts)> {
        let current_start = self.window_start(now);
        let mut buckets: Vec<(u64, BucketCounts)> = self
            .buckets
            .iter()
            .filter_map(|bucket| {
                let start = bucket.start.load(Ordering::Acquire);
                let completed = start < current_start && start > since_ms;
                if completed && self.is_live(start, now) {
                    Some((start, bucket.counts()))
                } else {
                    None
                }
            })
            .collect();
        buckets.sort_by_key(|(start, _)| *start);
        buckets
    }
}

// ============================================================================
// 资源节点
// ============================================================================

/// 资源统计节点
///
/// # 示例
/// ```rust
/// use flowsentry::clock::ManualClock;
/// use flowsentry::statistics::ResourceNode;
/// use std::sync::Arc;
///
/// let node = ResourceNode::new("HelloWorld", 10, 1000, Arc::new(ManualClock::new(0)));
/// node.add_pass(3);
/// assert_eq!(node.pass_qps(), 3.0);
/// ```
pub struct ResourceNode {
    name: Arc<str>,
    second: SlidingWindow,
    minute: SlidingWindow,
    in_flight: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ResourceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceNode")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl ResourceNode {
    pub fn new(
        name: impl Into<Arc<str>>,
        sample_count: u32,
        interval_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            second: SlidingWindow::new(sample_count, interval_ms),
            minute: SlidingWindow::new(MINUTE_SAMPLE_COUNT, MINUTE_INTERVAL_MS),
            in_flight: AtomicU64::new(0),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    fn record(&self, event: MetricEvent, n: u64) {
        let now = self.clock.now_millis();
        self.second.add(now, event, n);
        self.minute.add(now, event, n);
    }

    pub fn add_pass(&self, weight: u64) {
        self.record(MetricEvent::Pass, weight);
    }

    pub fn add_block(&self, weight: u64) {
        self.record(MetricEvent::Block, weight);
    }

    pub fn add_exception(&self, n: u64) {
        self.record(MetricEvent::Exception, n);
    }

    /// 记录完成数与响应时间（纳秒精度）
    pub fn add_response_time(&self, duration: Duration, completed: u64) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.record(MetricEvent::RtNanos, nanos);
        self.record(MetricEvent::Complete, completed);
    }

    fn window(&self) -> BucketCounts {
        self.second.sum(self.clock.now_millis())
    }

    /// 滑动窗口内的通过 QPS
    pub fn pass_qps(&self) -> f64 {
        self.window().pass as f64 / self.second.interval_secs()
    }

    pub fn block_qps(&self) -> f64 {
        self.window().block as f64 / self.second.interval_secs()
    }

    pub fn success_qps(&self) -> f64 {
        self.window().complete as f64 / self.second.interval_secs()
    }

    pub fn exception_qps(&self) -> f64 {
        self.window().exception as f64 / self.second.interval_secs()
    }

    /// 滑动窗口内的平均响应时间（毫秒）
    pub fn avg_rt_ms(&self) -> f64 {
        let counts = self.window();
        if counts.complete == 0 {
            return 0.0;
        }
        counts.rt_nanos as f64 / counts.complete as f64 / 1_000_000.0
    }

    /// 当前并发数
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn increase_in_flight(&self, weight: u64) {
        self.in_flight.fetch_add(weight, Ordering::AcqRel);
    }

    /// 仅当占用后不超过 `cap` 时才增加并发数
    pub(crate) fn try_increase_in_flight(&self, weight: u64, cap: u64) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(weight)?;
                (next <= cap).then_some(next)
            })
            .is_ok()
    }

    pub(crate) fn decrease_in_flight(&self, weight: u64) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(weight))
            });
    }

    pub(crate) fn completed_seconds_since(&self, since_ms: u64) -> Vec<(u64, BucketCounts)> {
        self.minute
            .completed_since(since_ms, self.clock.now_millis())
    }

    /// 统计快照
    pub fn stats(&self) -> NodeStats {
        let counts = self.window();
        let secs = self.second.interval_secs();
        NodeStats {
            resource: self.name.to_string(),
            pass_qps: counts.pass as f64 / secs,
            block_qps: counts.block as f64 / secs,
            success_qps: counts.complete as f64 / secs,
            exception_qps: counts.exception as f64 / secs,
            avg_rt_ms: if counts.complete == 0 {
                0.0
            } else {
                counts.rt_nanos as f64 / counts.complete as f64 / 1_000_000.0
            },
            in_flight: self.in_flight(),
        }
    }
}

/// 资源统计快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStats {
    pub resource: String,
    pub pass_qps: f64,
    pub block_qps: f64,
    pub success_qps: f64,
    pub exception_qps: f64,
    pub avg_rt_ms: f64,
    pub in_flight: u64,
}

// ============================================================================
// 单元测试
// ============================================================================
