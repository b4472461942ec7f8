//! 流控规则
//!
//! 规则是不可变的值对象，由调用方提供并保存在内存中。
//! 非法规则在加载时被拒绝，永远不会进入热路径。

use crate::constants::{
    DEFAULT_COLD_FACTOR, DEFAULT_IDLE_QPS, DEFAULT_MAX_QUEUEING_TIME_MS,
    DEFAULT_WARM_UP_PERIOD_SECS,
};
use crate::error::FlowSentryError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 阈值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Grade {
    /// 每秒通过数
    #[default]
    Qps,
    /// 并发数
    Concurrency,
}

/// 流控效果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlBehavior {
    /// 超过阈值直接拒绝
    #[default]
    Reject,
    /// 冷启动预热
    WarmUp,
    /// 匀速排队
    RateLimiter,
    /// 预热 + 匀速排队
    WarmUpRateLimiter,
}

/// 统计来源
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    /// 使用资源自身的统计
    #[default]
    Direct,
    /// 使用关联资源的统计
    Relate { ref_resource: String },
}

/// 流控规则
///
/// # 示例
/// ```rust
/// use flowsentry::rule::{ControlBehavior, FlowRule};
///
/// let rule = FlowRule::qps("HelloWorld", 20.0);
/// assert!(rule.validate().is_ok());
///
/// let warm = FlowRule::qps("HelloWorld", 90.0).with_behavior(ControlBehavior::WarmUp);
/// assert_eq!(warm.cold_factor, 3.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRule {
    pub resource: String,
    #[serde(default)]
    pub grade: Grade,
    /// QPS 阈值或最大并发数
    pub threshold: f64,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub control_behavior: ControlBehavior,
    #[serde(default = "default_warm_up_period_sec")]
    pub warm_up_period_sec: u64,
    #[serde(default = "default_cold_factor")]
    pub cold_factor: f64,
    /// 低于等于该 QPS 视为空闲
    #[serde(default = "default_idle_qps")]
    pub idle_qps: f64,
    #[serde(default = "default_max_queueing_time_ms")]
    pub max_queueing_time_ms: u64,
}

fn default_warm_up_period_sec() -> u64 {
    DEFAULT_WARM_UP_PERIOD_SECS
}

fn default_cold_factor() -> f64 {
    DEFAULT_COLD_FACTOR
}

fn default_idle_qps() -> f64 {
    DEFAULT_IDLE_QPS
}

fn default_max_queueing_time_ms() -> u64 {
    DEFAULT_MAX_QUEUEING_TIME_MS
}

impl FlowRule {
    /// 创建 QPS 规则
    pub fn qps(resource: impl Into<String>, threshold: f64) -> Self {
        Self {
            resource: resource.into(),
            grade: Grade::Qps,
            threshold,
            strategy: Strategy::Direct,
            control_behavior: ControlBehavior::Reject,
            warm_up_period_sec: DEFAULT_WARM_UP_PERIOD_SECS,
            cold_factor: DEFAULT_COLD_FACTOR,
            idle_qps: DEFAULT_IDLE_QPS,
            max_queueing_time_ms: DEFAULT_MAX_QUEUEING_TIME_MS,
        }
    }

    /// 创建并发数规则
    pub fn concurrency(resource: impl Into<String>, max_concurrent: u32) -> Self {
        Self {
            grade: Grade::Concurrency,
            ..Self::qps(resource, f64::from(max_concurrent))
        }
    }

    pub fn with_behavior(mut self, behavior: ControlBehavior) -> Self {
        self.control_behavior = behavior;
        self
    }

    /// 设置预热参数
    pub fn with_warm_up(mut self, period: Duration, cold_factor: f64) -> Self {
        self.warm_up_period_sec = period.as_secs();
        self.cold_factor = cold_factor;
        self
    }

    pub fn with_idle_qps(mut self, idle_qps: f64) -> Self {
        self.idle_qps = idle_qps;
        self
    }

    pub fn with_max_queueing_time(mut self, max_wait: Duration) -> Self {
        self.max_queueing_time_ms = u64::try_from(max_wait.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// 使用关联资源的统计
    pub fn relate_to(mut self, ref_resource: impl Into<String>) -> Self {
        self.strategy = Strategy::Relate {
            ref_resource: ref_resource.into(),
        };
        self
    }

    /// 关联资源名（仅 Relate 策略）
    pub fn ref_resource(&self) -> Option<&str> {
        match &self.strategy {
            Strategy::Direct => None,
            Strategy::Relate { ref_resource } => Some(ref_resource),
        }
    }

    pub fn warm_up_period(&self) -> Duration {
        Duration::from_secs(self.warm_up_period_sec)
    }

    pub fn max_queueing_time(&self) -> Duration {
        Duration::from_millis(self.max_queueing_time_ms)
    }

    /// 校验规则
    pub fn validate(&self) -> Result<(), FlowSentryError> {
        if self.resource.is_empty() {
            return Err(FlowSentryError::Validation("资源名不能为空".to_string()));
        }

        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(FlowSentryError::Validation(format!(
                "资源 {} 的阈值无效: {}",
                self.resource, self.threshold
            )));
        }

        match (self.grade, self.control_behavior) {
            (Grade::Qps, _) | (Grade::Concurrency, ControlBehavior::Reject) => {}
            (Grade::Concurrency, behavior) => {
                return Err(FlowSentryError::Validation(format!(
                    "资源 {} 的并发数规则不支持流控效果 {:?}",
                    self.resource, behavior
                )));
            }
        }

        if matches!(
            self.control_behavior,
            ControlBehavior::WarmUp | ControlBehavior::WarmUpRateLimiter
        ) {
            if self.warm_up_period_sec == 0 {
                return Err(FlowSentryError::Validation(format!(
                    "资源 {} 的预热时长必须大于0",
                    self.resource
                )));
            }
            if !self.cold_factor.is_finite() || self.cold_factor <= 1.0 {
                return Err(FlowSentryError::Validation(format!(
                    "资源 {} 的冷启动因子必须大于1: {}",
                    self.resource, self.cold_factor
                )));
            }
            if !self.idle_qps.is_finite() || self.idle_qps < 0.0 {
                return Err(FlowSentryError::Validation(format!(
                    "资源 {} 的空闲阈值无效: {}",
                    self.resource, self.idle_qps
                )));
            }
        }

        if let Strategy::Relate { ref_resource } = &self.strategy {
            if ref_resource.is_empty() {
                return Err(FlowSentryError::Validation(format!(
                    "资源 {} 的关联资源名不能为空",
                    self.resource
                )));
            }
            if ref_resource == &self.resource {
                return Err(FlowSentryError::Validation(format!(
                    "资源 {} 不能关联自身",
                    self.resource
                )));
            }
        }

        Ok(())
    }
}
