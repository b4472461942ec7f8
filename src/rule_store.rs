//! 规则存储
//!
//! 规则表整体保存在 `ArcSwap` 中，写时复制：
//!
//! - 读取无锁，只增加一次引用计数
//! - 同一资源的规则集整体替换，读取方不会看到新旧混合的规则
//! - 不同资源的加载通过 `rcu` 重试合并，互不阻塞；同一资源后写者生效

use crate::controllers::{build_controller, ConcurrencyController, TrafficController};
use crate::error::FlowSentryError;
use crate::rule::{FlowRule, Grade, Strategy};
use ahash::AHashMap as HashMap;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// 规则集中的单条规则及其控制器
#[derive(Debug, Clone)]
pub struct RuleEntry {
    rule: Arc<FlowRule>,
    controller: Arc<dyn TrafficController>,
    ref_resource: Option<Arc<str>>,
}

impl RuleEntry {
    fn new(rule: FlowRule) -> Self {
        let controller = build_controller(&rule);
        let ref_resource = rule.ref_resource().map(Arc::from);
        Self {
            rule: Arc::new(rule),
            controller,
            ref_resource,
        }
    }

    pub fn rule(&self) -> &FlowRule {
        &self.rule
    }

    pub(crate) fn rule_arc(&self) -> &Arc<FlowRule> {
        &self.rule
    }

    pub(crate) fn controller(&self) -> &Arc<dyn TrafficController> {
        &self.controller
    }

    /// Relate 策略的关联资源
    pub(crate) fn ref_resource(&self) -> Option<&Arc<str>> {
        self.ref_resource.as_ref()
    }
}

/// 单个资源的不可变规则集
#[derive(Debug, Default)]
pub struct RuleSet {
    entries: Vec<RuleEntry>,
    /// 最严格的直接并发数上限及其规则下标
    concurrency_cap: Option<(u64, usize)>,
}

impl RuleSet {
    fn build(rules: Vec<FlowRule>) -> Self {
        let entries: Vec<RuleEntry> = rules.into_iter().map(RuleEntry::new).collect();
        let concurrency_cap = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.rule.grade == Grade::Concurrency && entry.rule.strategy == Strategy::Direct
            })
            .map(|(index, entry)| {
                (
                    ConcurrencyController::new(entry.rule.threshold).cap(),
                    index,
                )
            })
            .min_by_key(|(cap, _)| *cap);

        Self {
            entries,
            concurrency_cap,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 按加载顺序遍历规则
    pub fn rules(&self) -> impl Iterator<Item = &FlowRule> {
        self.entries.iter().map(|entry| entry.rule.as_ref())
    }

    /// 复制出规则列表
    pub fn to_rules(&self) -> Vec<FlowRule> {
        self.rules().cloned().collect()
    }

    pub(crate) fn entries(&self) -> &[RuleEntry] {
        &self.entries
    }

    pub(crate) fn concurrency_cap(&self) -> Option<(u64, &RuleEntry)> {
        self.concurrency_cap
            .map(|(cap, index)| (cap, &self.entries[index]))
    }
}

type RuleTable = HashMap<Arc<str>, Arc<RuleSet>>;

/// 规则存储
pub struct RuleStore {
    table: ArcSwap<RuleTable>,
    empty: Arc<RuleSet>,
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RuleTable::new()),
            empty: Arc::new(RuleSet::default()),
        }
    }

    fn validate_batch(resource: Option<&str>, rules: &[FlowRule]) -> Result<(), FlowSentryError> {
        for (index, rule) in rules.iter().enumerate() {
            rule.validate().map_err(|e| {
                warn!("规则[{}]校验失败: {}", index, e);
                e
            })?;
            if let Some(resource) = resource {
                if rule.resource != resource {
                    return Err(FlowSentryError::Validation(format!(
                        "规则[{}]的资源 {} 与加载目标 {} 不一致",
                        index, rule.resource, resource
                    )));
                }
            }
        }
        Ok(())
    }

    /// 整体替换某个资源的规则
    ///
    /// 空列表等同于清除该资源的规则。
    #[instrument(skip(self, rules), fields(count = rules.len()))]
    pub fn load_rules(&self, resource: &str, rules: Vec<FlowRule>) -> Result<(), FlowSentryError> {
        if resource.is_empty() {
            return Err(FlowSentryError::Validation("资源名不能为空".to_string()));
        }
        Self::validate_batch(Some(resource), &rules)?;

        let key: Arc<str> = Arc::from(resource);
        if rules.is_empty() {
            self.table.rcu(|table| {
                let mut next = RuleTable::clone(table);
                next.remove(&key);
                next
            });
            info!("资源 {} 的规则已清除", resource);
            return Ok(());
        }

        let count = rules.len();
        let set = Arc::new(RuleSet::build(rules));
        self.table.rcu(|table| {
            let mut next = RuleTable::clone(table);
            next.insert(key.clone(), set.clone());
            next
        });
        info!("资源 {} 加载了 {} 条规则", resource, count);
        Ok(())
    }

    /// 整体替换全部规则
    ///
    /// 规则按资源分组，组内保持原有顺序。
    #[instrument(skip(self, rules), fields(count = rules.len()))]
    pub fn load_all(&self, rules: Vec<FlowRule>) -> Result<(), FlowSentryError> {
        Self::validate_batch(None, &rules)?;

        let mut grouped: Vec<(Arc<str>, Vec<FlowRule>)> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for rule in rules {
            match positions.get(&rule.resource) {
                Some(&pos) => grouped[pos].1.push(rule),
                None => {
                    positions.insert(rule.resource.clone(), grouped.len());
                    grouped.push((Arc::from(rule.resource.as_str()), vec![rule]));
                }
            }
        }

        let table: RuleTable = grouped
            .into_iter()
            .map(|(resource, rules)| (resource, Arc::new(RuleSet::build(rules))))
            .collect();
        let resources = table.len();
        self.table.store(Arc::new(table));
        info!("全量加载规则，涉及 {} 个资源", resources);
        Ok(())
    }

    /// 获取资源的规则集（无锁）
    pub fn rules_for(&self, resource: &str) -> Arc<RuleSet> {
        match self.table.load().get(resource) {
            Some(set) => Arc::clone(set),
            None => Arc::clone(&self.empty),
        }
    }

    /// 已配置规则的资源
    pub fn resources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.load().keys().map(|k| k.to_string()).collect();
        names.sort();
        names
    }

    pub fn clear(&self, resource: &str) {
        self.table.rcu(|table| {
            let mut next = RuleTable::clone(table);
            next.remove(resource);
            next
        });
        debug!("清除资源 {} 的规则", resource);
    }

    pub fn clear_all(&self) {
        self.table.store(Arc::new(RuleTable::new()));
        debug!("清除全部规则");
    }
}
