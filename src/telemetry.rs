//! 可观测性集成
//!
//! - `telemetry` 特性：基于 tracing-subscriber 的日志初始化
//! - `monitoring` 特性：把每秒指标写入 Prometheus 注册表的 [`PrometheusMetricSink`]

#[cfg(feature = "telemetry")]
use crate::error::FlowSentryError;

/// 初始化全局日志订阅器
///
/// 优先读取 `RUST_LOG` 环境变量，未设置时使用 `default_directive`（如 `"info"`）。
///
/// # 返回
/// - `Err(FlowSentryError::Config)`: 指令无法解析，或全局订阅器已经设置
#[cfg(feature = "telemetry")]
pub fn init_logging(default_directive: &str) -> Result<(), FlowSentryError> {
    use tracing_subscriber::EnvFilter;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive)
            .map_err(|e| FlowSentryError::Config(format!("日志过滤指令无效: {}", e)))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| FlowSentryError::Config(format!("日志初始化失败: {}", e)))
}

#[cfg(feature = "monitoring")]
pub use prometheus_sink::PrometheusMetricSink;

#[cfg(feature = "monitoring")]
mod prometheus_sink {
    use crate::error::FlowSentryError;
    use crate::metrics::{MetricSink, MetricSnapshot};
    use async_trait::async_trait;
    use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

    /// Prometheus 指标输出端
    ///
    /// 计数器按资源名打标签，平均响应时间为最近一秒的值。
    #[derive(Clone)]
    pub struct PrometheusMetricSink {
        registry: Registry,
        pass_total: IntCounterVec,
        block_total: IntCounterVec,
        success_total: IntCounterVec,
        exception_total: IntCounterVec,
        avg_rt_ms: GaugeVec,
    }

    fn counter(name: &str, help: &str) -> Result<IntCounterVec, prometheus::Error> {
        IntCounterVec::new(Opts::new(name, help), &["resource"])
    }

    impl PrometheusMetricSink {
        /// 创建并注册到新的注册表
        pub fn new() -> Result<Self, prometheus::Error> {
            Self::with_registry(Registry::new())
        }

        /// 注册到已有的注册表
        pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
            let pass_total = counter("flowsentry_pass_total", "Admitted requests")?;
            let block_total = counter("flowsentry_block_total", "Blocked requests")?;
            let success_total = counter("flowsentry_success_total", "Completed requests")?;
            let exception_total = counter("flowsentry_exception_total", "Failed requests")?;
            let avg_rt_ms = GaugeVec::new(
                Opts::new("flowsentry_avg_rt_ms", "Average response time in milliseconds"),
                &["resource"],
            )?;

            registry.register(Box::new(pass_total.clone()))?;
            registry.register(Box::new(block_total.clone()))?;
            registry.register(Box::new(success_total.clone()))?;
            registry.register(Box::new(exception_total.clone()))?;
            registry.register(Box::new(avg_rt_ms.clone()))?;

            Ok(Self {
                registry,
                pass_total,
                block_total,
                success_total,
                exception_total,
                avg_rt_ms,
            })
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        /// 文本格式输出
        pub fn gather(&self) -> String {
            let mut buffer = Vec::new();
            let encoder = TextEncoder::new();
            if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
                return String::new();
            }
            String::from_utf8(buffer).unwrap_or_default()
        }
    }

    #[async_trait]
    impl MetricSink for PrometheusMetricSink {
        async fn export(&self, snapshots: &[MetricSnapshot]) -> Result<(), FlowSentryError> {
            for s in snapshots {
                let labels = [s.resource.as_str()];
                self.pass_total.with_label_values(&labels).inc_by(s.pass);
                self.block_total.with_label_values(&labels).inc_by(s.block);
                self.success_total.with_label_values(&labels).inc_by(s.success);
                self.exception_total
                    .with_label_values(&labels)
                    .inc_by(s.exception);
                self.avg_rt_ms.with_label_values(&labels).set(s.avg_rt_ms);
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "prometheus"
        }
    }

}
