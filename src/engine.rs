//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 流控引擎
//!
//! [`Engine`] 持有规则存储和资源节点表，是准入的唯一入口。
//!
//! # 准入流程
//!
//! 1. 查找（或创建）资源节点，无锁读取规则集快照
//! 2. 按加载顺序执行每条规则的控制器，任一拒绝即返回 [`BlockError`]
//! 3. 用 CAS 占用并发数，不超过最严格的直接并发规则
//! 4. 排队类规则需要等待时挂起调用方（同步为线程休眠，异步为 tokio 定时器）
//! 5. 记录通过数并返回 [`Entry`]
//!
//! 第 3 步之后的任何失败（包括异步任务在等待中被取消）都会回退已占用的并发数和排队额度。

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::constants::{MAX_WEIGHT, MIN_WEIGHT, NANOS_PER_MILLI};
use crate::controllers::{Admission, Reservation, TrafficController};
use crate::entry::Entry;
use crate::error::{BlockError, FlowSentryError, GuardError};
use crate::metrics::MetricSnapshot;
use crate::rule::FlowRule;
use crate::rule_store::{RuleEntry, RuleSet, RuleStore};
use crate::statistics::{NodeStats, ResourceNode};
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// 引擎
// ============================================================================

struct EngineInner {
    id: u64,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    rules: RuleStore,
    nodes: DashMap<Arc<str>, Arc<ResourceNode>>,
}

/// 流控引擎
///
/// 克隆只增加引用计数，所有克隆共享同一份规则和统计。
///
/// # 示例
/// ```rust
/// use flowsentry::{Engine, FlowRule};
///
/// let engine = Engine::new();
/// engine.load_rules("HelloWorld", vec![FlowRule::qps("HelloWorld", 20.0)]).unwrap();
///
/// match engine.entry("HelloWorld") {
///     Ok(_entry) => { /* 受保护的业务逻辑 */ }
///     Err(block) => println!("blocked: {}", block),
/// }
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.inner.id)
            .field("resources", &self.inner.nodes.len())
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// 使用默认配置和系统时钟创建引擎
    pub fn new() -> Self {
        Self::build(EngineConfig::default(), Arc::new(SystemClock))
    }

    /// 使用指定配置创建引擎
    pub fn with_config(config: EngineConfig) -> Result<Self, FlowSentryError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// 使用指定配置和时钟创建引擎
    ///
    /// # 参数
    /// - `config`: 引擎配置，创建前校验
    /// - `clock`: 时间源，测试中通常为 [`crate::clock::ManualClock`]
    pub fn with_clock(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, FlowSentryError> {
        config.validate()?;
        Ok(Self::build(config, clock))
    }

    fn build(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            "创建流控引擎: id={}, sample_count={}, interval_ms={}",
            id, config.sample_count, config.interval_ms
        );
        Self {
            inner: Arc::new(EngineInner {
                id,
                config,
                clock,
                rules: RuleStore::new(),
                nodes: DashMap::new(),
            }),
        }
    }

    /// 进程内唯一的引擎 ID
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    // ==================== 规则配置 ====================

    /// 整体替换资源的规则
    ///
    /// # 参数
    /// - `resource`: 资源名
    /// - `rules`: 新规则，按顺序执行；空列表清除该资源的规则
    ///
    /// # 返回
    /// - `Err(FlowSentryError::Validation)`: 任一规则非法，原规则保持不变
    #[instrument(skip(self, rules), fields(engine = self.inner.id))]
    pub fn load_rules(&self, resource: &str, rules: Vec<FlowRule>) -> Result<(), FlowSentryError> {
        let has_rules = !rules.is_empty();
        self.inner.rules.load_rules(resource, rules)?;
        if has_rules {
            self.node(resource);
        }
        Ok(())
    }

    /// 整体替换全部资源的规则
    #[instrument(skip(self, rules), fields(engine = self.inner.id))]
    pub fn load_all_rules(&self, rules: Vec<FlowRule>) -> Result<(), FlowSentryError> {
        let resources: Vec<String> = rules.iter().map(|r| r.resource.clone()).collect();
        self.inner.rules.load_all(rules)?;
        for resource in &resources {
            self.node(resource);
        }
        Ok(())
    }

    /// 清除资源的规则，统计保留
    pub fn clear_rules(&self, resource: &str) {
        self.inner.rules.clear(resource);
    }

    pub fn clear_all_rules(&self) {
        self.inner.rules.clear_all();
    }

    /// 资源当前的规则
    pub fn rules_for(&self, resource: &str) -> Vec<FlowRule> {
        self.inner.rules.rules_for(resource).to_rules()
    }

    /// 资源当前的规则集快照
    pub fn rule_set(&self, resource: &str) -> Arc<RuleSet> {
        self.inner.rules.rules_for(resource)
    }

    /// 已配置规则的资源
    pub fn configured_resources(&self) -> Vec<String> {
        self.inner.rules.resources()
    }

    // ==================== 资源节点 ====================

    fn node(&self, resource: &str) -> Arc<ResourceNode> {
        if let Some(node) = self.inner.nodes.get(resource) {
            return Arc::clone(node.value());
        }
        let node = self
            .inner
            .nodes
            .entry(Arc::from(resource))
            .or_insert_with(|| {
                debug!("创建资源节点: {}", resource);
                Arc::new(ResourceNode::new(
                    resource,
                    self.inner.config.sample_count,
                    self.inner.config.interval_ms,
                    Arc::clone(&self.inner.clock),
                ))
            });
        Arc::clone(node.value())
    }

    /// 已有统计的资源节点
    pub fn resource_node(&self, resource: &str) -> Option<Arc<ResourceNode>> {
        self.inner
            .nodes
            .get(resource)
            .map(|node| Arc::clone(node.value()))
    }

    /// 资源的统计快照，资源从未出现过时返回 `None`
    pub fn node_stats(&self, resource: &str) -> Option<NodeStats> {
        self.inner.nodes.get(resource).map(|node| node.stats())
    }

    /// 所有资源的统计快照，按资源名排序
    pub fn all_node_stats(&self) -> Vec<NodeStats> {
        let mut stats: Vec<NodeStats> = self
            .inner
            .nodes
            .iter()
            .map(|node| node.value().stats())
            .collect();
        stats.sort_by(|a, b| a.resource.cmp(&b.resource));
        stats
    }

    /// 开始时间晚于 `since_ms` 且已经结束的每秒指标
    ///
    /// 没有任何流量的秒不输出。结果按时间、资源名排序。
    pub fn metric_snapshots_since(&self, since_ms: u64) -> Vec<MetricSnapshot> {
        let mut snapshots: Vec<MetricSnapshot> = self
            .inner
            .nodes
            .iter()
            .flat_map(|node| {
                let name = Arc::clone(node.value().name_arc());
                node.value()
                    .completed_seconds_since(since_ms)
                    .into_iter()
                    .filter(|(_, counts)| !counts.is_empty())
                    .map(move |(start, counts)| {
                        MetricSnapshot::from_counts(&name, start, &counts)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        snapshots.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.resource.cmp(&b.resource))
        });
        snapshots
    }

    // ==================== 准入 ====================

    fn check_weight(weight: u32) -> Result<(), FlowSentryError> {
        if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&weight) {
            return Err(FlowSentryError::Validation(format!(
                "权重必须在 {}..={} 之间: {}",
                MIN_WEIGHT, MAX_WEIGHT, weight
            )));
        }
        Ok(())
    }

    /// 以权重 1 申请准入
    ///
    /// 未配置规则的资源总是放行，统计照常记录。
    pub fn entry(&self, resource: &str) -> Result<Entry, BlockError> {
        self.enter(resource, 1)
    }

    /// 以指定权重申请准入
    ///
    /// # 返回
    /// - `Ok(Entry)`: 放行
    /// - `Err(FlowSentryError::Blocked)`: 被规则拒绝
    /// - `Err(FlowSentryError::Validation)`: 权重不在 `1..=MAX_WEIGHT` 内
    pub fn entry_with(&self, resource: &str, weight: u32) -> Result<Entry, FlowSentryError> {
        Self::check_weight(weight)?;
        Ok(self.enter(resource, weight)?)
    }

    /// 异步申请准入
    ///
    /// 排队等待使用 tokio 定时器，不占用线程。等待期间 future 被丢弃时，
    /// 已占用的并发数和排队额度会被归还，请求视为未放行。
    pub async fn entry_async(&self, resource: &str) -> Result<Entry, BlockError> {
        self.enter_async(resource, 1).await
    }

    pub async fn entry_async_with(
        &self,
        resource: &str,
        weight: u32,
    ) -> Result<Entry, FlowSentryError> {
        Self::check_weight(weight)?;
        Ok(self.enter_async(resource, weight).await?)
    }

    fn enter(&self, resource: &str, weight: u32) -> Result<Entry, BlockError> {
        let admitted = self.evaluate(resource, weight)?;
        if let Some(wait) = admitted.wait {
            trace!("排队等待: resource={}, wait={:?}", resource, wait);
            std::thread::sleep(wait);
        }
        Ok(admitted.commit(self.inner.id))
    }

    async fn enter_async(&self, resource: &str, weight: u32) -> Result<Entry, BlockError> {
        let admitted = self.evaluate(resource, weight)?;
        if let Some(wait) = admitted.wait {
            trace!("排队等待: resource={}, wait={:?}", resource, wait);
            tokio::time::sleep(wait).await;
        }
        Ok(admitted.commit(self.inner.id))
    }

    /// 规则判定和并发数占用，不做等待
    fn evaluate(&self, resource: &str, weight: u32) -> Result<Admitted, BlockError> {
        let node = self.node(resource);
        let rules = self.inner.rules.rules_for(resource);
        let now_nanos = self.inner.clock.now_nanos();
        let now = now_nanos / NANOS_PER_MILLI;
        let units = u64::from(weight);

        let mut pending = Pending::new(Arc::clone(&node), units);
        let mut wait = Duration::ZERO;

        for rule in rules.entries() {
            let Some(stat_node) = self.stat_node(&node, rule) else {
                continue;
            };
            match rule.controller().check(&stat_node, units, now_nanos) {
                Admission::Pass => {}
                Admission::Reserved(reservation) => {
                    wait = wait.max(reservation.wait());
                    pending
                        .reserved
                        .push((Arc::clone(rule.controller()), reservation));
                }
                Admission::Block => {
                    drop(pending);
                    return Err(self.block(&node, rule, units));
                }
            }
        }

        match rules.concurrency_cap() {
            Some((cap, rule)) => {
                if !node.try_increase_in_flight(units, cap) {
                    drop(pending);
                    return Err(self.block(&node, rule, units));
                }
            }
            None => node.increase_in_flight(units),
        }
        pending.holds_in_flight = true;

        Ok(Admitted {
            pending,
            rules,
            weight,
            created_ms: now,
            wait: (!wait.is_zero()).then_some(wait),
        })
    }

    /// 规则读取的统计节点；关联资源从未出现过时返回 `None`
    fn stat_node(&self, node: &Arc<ResourceNode>, rule: &RuleEntry) -> Option<Arc<ResourceNode>> {
        match rule.ref_resource() {
            None => Some(Arc::clone(node)),
            Some(ref_resource) => self
                .inner
                .nodes
                .get(ref_resource.as_ref())
                .map(|n| Arc::clone(n.value())),
        }
    }

    fn block(&self, node: &ResourceNode, rule: &RuleEntry, weight: u64) -> BlockError {
        node.add_block(weight);
        let kind = rule.controller().block_kind();
        debug!(
            "请求被拒绝: resource={}, kind={}, threshold={}",
            node.name(),
            kind,
            rule.rule().threshold
        );
        BlockError::new(Arc::clone(node.name_arc()), Arc::clone(rule.rule_arc()), kind)
    }

    // ==================== 退出 ====================

    /// 使用调用方测量的响应时间退出令牌
    ///
    /// # 返回
    /// - `Err(FlowSentryError::Misuse)`: 令牌不是本引擎签发的，或已经退出
    pub fn exit(
        &self,
        entry: &mut Entry,
        response_time: Duration,
        exception: bool,
    ) -> Result<(), FlowSentryError> {
        if entry.engine_id() != self.inner.id {
            error!(
                "令牌来自其他引擎: resource={}, entry_engine={}, engine={}",
                entry.resource(),
                entry.engine_id(),
                self.inner.id
            );
            return Err(FlowSentryError::Misuse(format!(
                "资源 {} 的令牌不是由引擎 {} 签发的",
                entry.resource(),
                self.inner.id
            )));
        }
        entry.exit_with(response_time, exception)
    }

    // ==================== 受保护执行 ====================

    /// 在令牌保护下执行闭包
    ///
    /// 闭包返回 `Err` 时计为异常；无论结果如何令牌都会退出。
    ///
    /// # 示例
    /// ```rust
    /// use flowsentry::{Engine, GuardError};
    ///
    /// let engine = Engine::new();
    /// let result: Result<u32, GuardError<String>> = engine.guard("compute", 1, || Ok(42));
    /// assert_eq!(result.unwrap(), 42);
    /// ```
    pub fn guard<T, E, F>(&self, resource: &str, weight: u32, f: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut entry = self.entry_with(resource, weight)?;
        let result = f();
        Self::finish_guarded(&mut entry, result)
    }

    /// 在令牌保护下执行异步逻辑
    ///
    /// 被拒绝时 `f` 不会被调用。外层 future 被取消时令牌随之 Drop 并退出。
    pub async fn guard_async<T, E, F, Fut>(
        &self,
        resource: &str,
        weight: u32,
        f: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut entry = self.entry_async_with(resource, weight).await?;
        let result = f().await;
        Self::finish_guarded(&mut entry, result)
    }

    fn finish_guarded<T, E>(entry: &mut Entry, result: Result<T, E>) -> Result<T, GuardError<E>> {
        if result.is_err() {
            entry.set_error();
        }
        entry.exit()?;
        result.map_err(GuardError::Inner)
    }
}

// ============================================================================
// 准入中间状态
// ============================================================================

/// 已通过判定、尚未放行的请求
struct Admitted {
    pending: Pending,
    rules: Arc<RuleSet>,
    weight: u32,
    created_ms: u64,
    wait: Option<Duration>,
}

impl Admitted {
    fn commit(self, engine_id: u64) -> Entry {
        let Admitted {
            mut pending,
            rules,
            weight,
            created_ms,
            ..
        } = self;
        pending.node.add_pass(u64::from(weight));
        pending.settled = true;
        Entry::new(engine_id, Arc::clone(&pending.node), rules, weight, created_ms)
    }
}

/// 回退守卫
///
/// 未提交就被丢弃时归还排队预留和并发数。
struct Pending {
    node: Arc<ResourceNode>,
    weight: u64,
    reserved: Vec<(Arc<dyn TrafficController>, Reservation)>,
    holds_in_flight: bool,
    settled: bool,
}

impl Pending {
    fn new(node: Arc<ResourceNode>, weight: u64) -> Self {
        Self {
            node,
            weight,
            reserved: Vec::new(),
            holds_in_flight: false,
            settled: false,
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        for (controller, reservation) in self.reserved.drain(..).rev() {
            controller.abandon(&reservation);
        }
        if self.holds_in_flight {
            self.node.decrease_in_flight(self.weight);
            trace!("准入被取消，归还并发数: resource={}", self.node.name());
        }
    }
}

// ============================================================================
// 单元测试
// ============================================================================
