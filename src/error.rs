//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型。`BlockError` 是热路径上的正常分支，
//! 构造时不分配内存；其余错误面向开发者，应尽早失败。

use crate::rule::FlowRule;
use std::sync::Arc;
use thiserror::Error;

/// flowsentry 错误类型
#[derive(Error, Debug)]
pub enum FlowSentryError {
    /// 规则或参数校验失败
    #[error("验证错误: {0}")]
    Validation(String),

    /// 调用方误用（重复 exit、跨引擎 exit）
    #[error("误用错误: {0}")]
    Misuse(String),

    /// 请求被流控规则拒绝
    #[error(transparent)]
    Blocked(#[from] BlockError),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// IO错误
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML解析错误
    #[error("YAML解析错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML解析错误
    #[error("TOML解析错误: {0}")]
    Toml(#[from] toml::de::Error),
}

impl FlowSentryError {
    /// 是否为流控拒绝
    pub fn is_blocked(&self) -> bool {
        matches!(self, FlowSentryError::Blocked(_))
    }

    /// 取出拒绝信息
    pub fn as_block(&self) -> Option<&BlockError> {
        match self {
            FlowSentryError::Blocked(block) => Some(block),
            _ => None,
        }
    }
}

/// 拒绝类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum BlockKind {
    /// QPS 直接拒绝
    Qps,
    /// 并发数超限
    Concurrency,
    /// 预热阶段阈值不足
    WarmUp,
    /// 排队等待超过最大排队时间
    QueueTimeout,
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BlockKind::Qps => "qps",
            BlockKind::Concurrency => "concurrency",
            BlockKind::WarmUp => "warm_up",
            BlockKind::QueueTimeout => "queue_timeout",
        };
        f.write_str(name)
    }
}

/// 流控拒绝
///
/// 克隆只增加两个引用计数。
#[derive(Error, Debug, Clone)]
#[error("资源 {resource} 被流控拒绝 ({kind}, 阈值 {})", .rule.threshold)]
pub struct BlockError {
    resource: Arc<str>,
    rule: Arc<FlowRule>,
    kind: BlockKind,
}

impl BlockError {
    pub(crate) fn new(resource: Arc<str>, rule: Arc<FlowRule>, kind: BlockKind) -> Self {
        Self {
            resource,
            rule,
            kind,
        }
    }

    /// 被拒绝的资源名
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// 触发拒绝的规则
    pub fn rule(&self) -> &FlowRule {
        &self.rule
    }

    /// 拒绝类型
    pub fn kind(&self) -> BlockKind {
        self.kind
    }
}

/// `Engine::guard` 系列方法的错误
#[derive(Error, Debug)]
pub enum GuardError<E> {
    /// 请求被拒绝，受保护逻辑未执行
    #[error(transparent)]
    Blocked(BlockError),

    /// 准入参数无效，受保护逻辑未执行
    #[error(transparent)]
    Invalid(FlowSentryError),

    /// 受保护逻辑自身返回的错误
    #[error("受保护逻辑失败: {0}")]
    Inner(E),
}

impl<E> GuardError<E> {
    /// 是否为流控拒绝
    pub fn is_blocked(&self) -> bool {
        matches!(self, GuardError::Blocked(_))
    }

    /// 取出受保护逻辑的错误
    pub fn into_inner(self) -> Option<E> {
        match self {
            GuardError::Inner(err) => Some(err),
            _ => None,
        }
    }
}

impl<E> From<FlowSentryError> for GuardError<E> {
    fn from(err: FlowSentryError) -> Self {
        match err {
            FlowSentryError::Blocked(block) => GuardError::Blocked(block),
            other => GuardError::Invalid(other),
        }
    }
}

impl<E> From<BlockError> for GuardError<E> {
    fn from(block: BlockError) -> Self {
        GuardError::Blocked(block)
    }
}
