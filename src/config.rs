//! 配置模块
//!
//! 定义引擎配置和规则文件的结构，支持 YAML、JSON、TOML 三种格式。

use crate::constants::{
    DEFAULT_INTERVAL_MS, DEFAULT_METRIC_FLUSH_INTERVAL_SECS, DEFAULT_SAMPLE_COUNT,
    MAX_SAMPLE_COUNT,
};
use crate::error::FlowSentryError;
use crate::rule::FlowRule;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, instrument};

/// 引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 秒级窗口的子桶数
    pub sample_count: u32,
    /// 秒级窗口长度（毫秒）
    pub interval_ms: u64,
    pub metric: MetricConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_count: DEFAULT_SAMPLE_COUNT,
            interval_ms: DEFAULT_INTERVAL_MS,
            metric: MetricConfig::default(),
        }
    }
}

impl EngineConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), FlowSentryError> {
        if self.sample_count == 0 || self.sample_count > MAX_SAMPLE_COUNT {
            return Err(FlowSentryError::Config(format!(
                "sample_count 必须在 1..={} 之间: {}",
                MAX_SAMPLE_COUNT, self.sample_count
            )));
        }

        if self.interval_ms == 0 {
            return Err(FlowSentryError::Config("interval_ms 必须大于0".to_string()));
        }

        if self.interval_ms % u64::from(self.sample_count) != 0 {
            return Err(FlowSentryError::Config(format!(
                "interval_ms ({}) 必须能被 sample_count ({}) 整除",
                self.interval_ms, self.sample_count
            )));
        }

        self.metric.validate()
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, FlowSentryError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, FlowSentryError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, FlowSentryError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载，格式由扩展名决定
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FlowSentryError> {
        let config: Self = load_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }
}

/// 指标导出配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    pub enabled: bool,
    /// 导出间隔（秒）
    pub flush_interval_secs: u64,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_secs: DEFAULT_METRIC_FLUSH_INTERVAL_SECS,
        }
    }
}

impl MetricConfig {
    pub fn validate(&self) -> Result<(), FlowSentryError> {
        if self.enabled && self.flush_interval_secs == 0 {
            return Err(FlowSentryError::Config(
                "flush_interval_secs 必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// 规则文件
// ============================================================================

/// 规则文件
///
/// # 示例
/// ```rust
/// use flowsentry::config::RuleFile;
///
/// let yaml = r#"
/// rules:
///   - resource: HelloWorld
///     threshold: 20
/// "#;
/// let file = RuleFile::from_yaml_str(yaml).unwrap();
/// assert_eq!(file.rules.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<FlowRule>,
}

impl RuleFile {
    /// 校验文件中的每条规则
    pub fn validate(&self) -> Result<(), FlowSentryError> {
        for (index, rule) in self.rules.iter().enumerate() {
            rule.validate().map_err(|e| {
                FlowSentryError::Validation(format!("规则[{}]校验失败: {}", index, e))
            })?;
        }
        Ok(())
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, FlowSentryError> {
        let file: Self = serde_yaml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    pub fn from_json_str(content: &str) -> Result<Self, FlowSentryError> {
        let file: Self = serde_json::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, FlowSentryError> {
        let file: Self = toml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    /// 从文件加载，格式由扩展名决定（yaml/yml、json、toml）
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FlowSentryError> {
        let file: Self = load_file(path.as_ref())?;
        file.validate()?;
        Ok(file)
    }

    pub fn to_yaml_string(&self) -> Result<String, FlowSentryError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn into_rules(self) -> Vec<FlowRule> {
        self.rules
    }
}

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    /// 根据扩展名识别格式
    pub fn from_path(path: &Path) -> Result<Self, FlowSentryError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "json" => Ok(ConfigFormat::Json),
            "toml" => Ok(ConfigFormat::Toml),
            other => Err(FlowSentryError::Config(format!(
                "不支持的配置文件格式: {:?} ({})",
                other,
                path.display()
            ))),
        }
    }
}

fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T, FlowSentryError> {
    let format = ConfigFormat::from_path(path)?;
    let content = std::fs::read_to_string(path)?;
    debug!("读取配置文件: {} ({:?})", path.display(), format);
    let value = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(&content)?,
        ConfigFormat::Json => serde_json::from_str(&content)?,
        ConfigFormat::Toml => toml::from_str(&content)?,
    };
    Ok(value)
}
