//! 配置集成测试
//!
//! 测试规则文件、引擎配置文件的加载

use crate::common::drive;
use flowsentry::{ControlBehavior, Engine, EngineConfig, FlowSentryError, Grade, RuleFile};
use std::io::Write;

fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_yaml_rule_file_drives_engine() {
    let file = write_temp(
        ".yaml",
        r#"
rules:
  - resource: HelloWorld
    grade: QPS
    threshold: 20
  - resource: db
    grade: CONCURRENCY
    threshold: 2
"#,
    );
    let rules = RuleFile::from_path(file.path()).unwrap().into_rules();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[1].grade, Grade::Concurrency);

    let engine = Engine::new();
    engine.load_all_rules(rules).unwrap();
    let (passed, blocked) = drive(&engine, "HelloWorld", 25);
    assert!(passed <= 20);
    assert_eq!(passed + blocked, 25);

    let _a = engine.entry("db").unwrap();
    let _b = engine.entry("db").unwrap();
    assert!(engine.entry("db").is_err());
}

#[test]
fn test_json_rule_file() {
    let file = write_temp(
        ".json",
        r#"{"rules": [{
            "resource": "api",
            "threshold": 10,
            "control_behavior": "WARM_UP_RATE_LIMITER",
            "warm_up_period_sec": 5,
            "cold_factor": 2.5,
            "max_queueing_time_ms": 100
        }]}"#,
    );
    let rules = RuleFile::from_path(file.path()).unwrap().rules;
    assert_eq!(rules[0].control_behavior, ControlBehavior::WarmUpRateLimiter);
    assert_eq!(rules[0].cold_factor, 2.5);
    assert_eq!(rules[0].max_queueing_time_ms, 100);
}

#[test]
fn test_toml_rule_file_with_relate() {
    let file = write_temp(
        ".toml",
        r#"
[[rules]]
resource = "write"
threshold = 5.0

[rules.strategy]
type = "relate"
ref_resource = "read"
"#,
    );
    let rules = RuleFile::from_path(file.path()).unwrap().rules;
    assert_eq!(rules[0].ref_resource(), Some("read"));
}

#[test]
fn test_invalid_file_content() {
    let file = write_temp(".yaml", "rules: [");
    assert!(matches!(
        RuleFile::from_path(file.path()),
        Err(FlowSentryError::Yaml(_))
    ));

    let file = write_temp(".json", r#"{"rules": [{"resource": "a", "threshold": -1}]}"#);
    assert!(matches!(
        RuleFile::from_path(file.path()),
        Err(FlowSentryError::Validation(_))
    ));

    assert!(matches!(
        RuleFile::from_path("/nonexistent/rules.yaml"),
        Err(FlowSentryError::Io(_))
    ));
}

#[test]
fn test_engine_config_file() {
    let file = write_temp(
        ".yaml",
        "sample_count: 4\ninterval_ms: 2000\nmetric:\n  flush_interval_secs: 5\n",
    );
    let config = EngineConfig::from_path(file.path()).unwrap();
    assert_eq!(config.sample_count, 4);
    assert_eq!(config.interval_ms, 2_000);
    assert_eq!(config.metric.flush_interval_secs, 5);
    assert!(Engine::with_config(config).is_ok());

    let bad = write_temp(".toml", "sample_count = 7\ninterval_ms = 1000\n");
    assert!(matches!(
        EngineConfig::from_path(bad.path()),
        Err(FlowSentryError::Config(_))
    ));
}
