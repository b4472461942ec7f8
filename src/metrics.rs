//! 指标导出
//!
//! 引擎为每个资源保留最近 60 秒的每秒统计。[`MetricExporter`] 按固定间隔
//! 取出已经结束的秒，推送给所有 [`MetricSink`]。
//!
//! # 示例
//!
//! ```rust,no_run
//! use flowsentry::metrics::{MetricExporter, TracingMetricSink};
//! use flowsentry::Engine;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Engine::new();
//!     let handle = MetricExporter::new(engine.clone(), Duration::from_secs(1))
//!         .with_sink(Arc::new(TracingMetricSink))
//!         .spawn();
//!
//!     // ...
//!
//!     handle.stop().await;
//! }
//! ```

use crate::engine::Engine;
use crate::error::FlowSentryError;
use crate::statistics::BucketCounts;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// 指标快照
// ============================================================================

/// 单个资源一秒内的统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    /// 该秒的起始时间
    pub timestamp: DateTime<Utc>,
    pub timestamp_ms: u64,
    pub resource: String,
    pub pass: u64,
    pub block: u64,
    /// 完成的调用数
    pub success: u64,
    pub exception: u64,
    pub avg_rt_ms: f64,
}

impl MetricSnapshot {
    pub(crate) fn from_counts(resource: &str, start_ms: u64, counts: &BucketCounts) -> Self {
        let avg_rt_ms = if counts.complete == 0 {
            0.0
        } else {
            counts.rt_nanos as f64 / counts.complete as f64 / 1_000_000.0
        };
        Self {
            timestamp: DateTime::from_timestamp_millis(i64::try_from(start_ms).unwrap_or(i64::MAX))
                .unwrap_or_default(),
            timestamp_ms: start_ms,
            resource: resource.to_string(),
            pass: counts.pass,
            block: counts.block,
            success: counts.complete,
            exception: counts.exception,
            avg_rt_ms,
        }
    }

    /// 竖线分隔的文本形式
    ///
    /// `timestamp_ms|resource|pass|block|success|exception|avg_rt_ms`
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{:.2}",
            self.timestamp_ms,
            self.resource,
            self.pass,
            self.block,
            self.success,
            self.exception,
            self.avg_rt_ms
        )
    }
}

// ============================================================================
// 输出端
// ============================================================================

/// 指标输出端
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// 输出一批快照
    async fn export(&self, snapshots: &[MetricSnapshot]) -> Result<(), FlowSentryError>;

    /// 名称，用于日志
    fn name(&self) -> &str {
        "metric-sink"
    }
}

/// 以 tracing 事件输出指标
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricSink;

#[async_trait]
impl MetricSink for TracingMetricSink {
    async fn export(&self, snapshots: &[MetricSnapshot]) -> Result<(), FlowSentryError> {
        for snapshot in snapshots {
            info!(
                target: "flowsentry::metrics",
                resource = %snapshot.resource,
                timestamp = snapshot.timestamp_ms,
                pass = snapshot.pass,
                block = snapshot.block,
                success = snapshot.success,
                exception = snapshot.exception,
                avg_rt_ms = snapshot.avg_rt_ms,
                "{}",
                snapshot.to_line()
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

// ============================================================================
// 导出器
// ============================================================================

/// 周期性指标导出器
pub struct MetricExporter {
    engine: Engine,
    interval: Duration,
    sinks: Vec<Arc<dyn MetricSink>>,
}

impl MetricExporter {
    pub fn new(engine: Engine, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            sinks: Vec::new(),
        }
    }

    /// 按引擎配置创建；指标导出被禁用时返回 `None`
    pub fn from_engine_config(engine: Engine) -> Option<Self> {
        let metric = engine.config().metric.clone();
        metric
            .enabled
            .then(|| Self::new(engine, Duration::from_secs(metric.flush_interval_secs)))
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// 导出 `last_ms` 之后结束的秒，并推进 `last_ms`
    ///
    /// # 返回
    /// 本次导出的快照数
    pub async fn flush(&self, last_ms: &mut u64) -> usize {
        let snapshots = self.engine.metric_snapshots_since(*last_ms);
        if snapshots.is_empty() {
            return 0;
        }
        if let Some(latest) = snapshots.iter().map(|s| s.timestamp_ms).max() {
            *last_ms = latest;
        }

        for sink in &self.sinks {
            if let Err(e) = sink.export(&snapshots).await {
                warn!("指标输出失败: sink={}, error={}", sink.name(), e);
            }
        }
        debug!("导出 {} 条指标", snapshots.len());
        snapshots.len()
    }

    /// 在后台任务中周期导出
    pub fn spawn(self) -> ExporterHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            let mut last_ms = 0;
            info!(
                "指标导出器启动: interval={:?}, sinks={}",
                self.interval,
                self.sinks.len()
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.flush(&mut last_ms).await;
                    }
                    _ = &mut shutdown_rx => {
                        self.flush(&mut last_ms).await;
                        info!("指标导出器停止");
                        break;
                    }
                }
            }
        });
        ExporterHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// 后台导出任务句柄
pub struct ExporterHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ExporterHandle {
    /// 停止导出，停止前最后导出一次
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("指标导出任务异常退出: {}", e);
        }
    }
}

impl Drop for ExporterHandle {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.task.abort();
        }
    }
}
