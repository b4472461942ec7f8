//! 准入令牌
//!
//! [`Entry`] 代表一次已被放行的调用，必须且只能退出一次。
//! 未显式退出的令牌在 Drop 时自动退出，因此 panic、提前返回或任务取消都不会泄漏并发数。

use crate::error::FlowSentryError;
use crate::rule::FlowRule;
use crate::rule_store::RuleSet;
use crate::statistics::ResourceNode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// 准入令牌
///
/// # 示例
/// ```rust
/// use flowsentry::Engine;
///
/// let engine = Engine::new();
/// let mut entry = engine.entry("HelloWorld").unwrap();
/// // 受保护的业务逻辑
/// entry.exit().unwrap();
/// assert!(entry.exit().is_err());
/// ```
#[derive(Debug)]
#[must_use = "丢弃令牌会立即退出，受保护逻辑应在令牌存活期间执行"]
pub struct Entry {
    engine_id: u64,
    node: Arc<ResourceNode>,
    rules: Arc<RuleSet>,
    weight: u32,
    created_ms: u64,
    started: Instant,
    error: bool,
    exited: bool,
}

impl Entry {
    pub(crate) fn new(
        engine_id: u64,
        node: Arc<ResourceNode>,
        rules: Arc<RuleSet>,
        weight: u32,
        created_ms: u64,
    ) -> Self {
        Self {
            engine_id,
            node,
            rules,
            weight,
            created_ms,
            started: Instant::now(),
            error: false,
            exited: false,
        }
    }

    pub(crate) fn engine_id(&self) -> u64 {
        self.engine_id
    }

    /// 资源名
    pub fn resource(&self) -> &str {
        self.node.name()
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// 准入时间（毫秒）
    pub fn created_at_ms(&self) -> u64 {
        self.created_ms
    }

    /// 本次准入通过的规则，按加载顺序
    pub fn passed_rules(&self) -> impl Iterator<Item = &FlowRule> {
        self.rules.rules()
    }

    /// 标记本次调用失败，退出时计为异常
    pub fn set_error(&mut self) {
        self.error = true;
    }

    pub fn is_exited(&self) -> bool {
        self.exited
    }

    /// 退出，响应时间取自准入以来的耗时
    pub fn exit(&mut self) -> Result<(), FlowSentryError> {
        let elapsed = self.started.elapsed();
        self.complete(elapsed, false)
    }

    /// 使用调用方测量的响应时间退出
    ///
    /// # 参数
    /// - `response_time`: 调用耗时
    /// - `exception`: 调用是否失败
    ///
    /// # 返回
    /// - `Ok(())`: 首次退出
    /// - `Err(FlowSentryError::Misuse)`: 令牌已经退出过，计数不变
    pub fn exit_with(
        &mut self,
        response_time: Duration,
        exception: bool,
    ) -> Result<(), FlowSentryError> {
        self.complete(response_time, exception)
    }

    fn complete(&mut self, response_time: Duration, exception: bool) -> Result<(), FlowSentryError> {
        if self.exited {
            error!("资源 {} 的令牌被重复退出", self.node.name());
            return Err(FlowSentryError::Misuse(format!(
                "资源 {} 的令牌已经退出",
                self.node.name()
            )));
        }
        self.exited = true;

        let weight = u64::from(self.weight);
        self.node.decrease_in_flight(weight);
        self.node
            .add_response_time(response_time.saturating_mul(self.weight), weight);
        if exception || self.error {
            self.node.add_exception(weight);
        }
        trace!(
            "退出: resource={}, rt={:?}, exception={}",
            self.node.name(),
            response_time,
            exception || self.error
        );
        Ok(())
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        if !self.exited {
            let elapsed = self.started.elapsed();
            let _ = self.complete(elapsed, false);
        }
    }
}
