//! 统计窗口集成测试
//!
//! 使用手动时钟验证滑动窗口和节点统计

use crate::common::{drive, manual_engine, manual_engine_with};
use flowsentry::{EngineConfig, FlowRule};
use std::time::Duration;

#[test]
fn test_first_call_observes_zero() {
    let (engine, _) = manual_engine(5_000);
    engine.load_rules("fresh", vec![FlowRule::qps("fresh", 1.0)]).unwrap();
    let stats = engine.node_stats("fresh").unwrap();
    assert_eq!(stats.pass_qps, 0.0);
    assert_eq!(stats.block_qps, 0.0);
    assert_eq!(stats.in_flight, 0);
    assert!(engine.entry("fresh").is_ok());
}

#[test]
fn test_window_slides_per_bucket() {
    let (engine, clock) = manual_engine(10_000);
    engine.load_rules("r", vec![FlowRule::qps("r", 10.0)]).unwrap();

    // 10_000 时刻通过 5 个
    assert_eq!(drive(&engine, "r", 5), (5, 0));

    // 500ms 后再通过 5 个，窗口已满
    clock.advance(Duration::from_millis(500));
    assert_eq!(drive(&engine, "r", 8), (5, 3));

    // 第一批滚出窗口后只释放 5 个额度
    clock.advance(Duration::from_millis(500));
    assert_eq!(drive(&engine, "r", 8), (5, 3));
}

#[test]
fn test_no_tumbling_reset_at_second_boundary() {
    let (engine, clock) = manual_engine(10_900);
    engine.load_rules("r", vec![FlowRule::qps("r", 3.0)]).unwrap();
    assert_eq!(drive(&engine, "r", 3), (3, 0));

    // 跨过整秒边界，但 10_900 的子桶仍在窗口内
    clock.advance(Duration::from_millis(200));
    assert_eq!(drive(&engine, "r", 3), (0, 3));

    clock.advance(Duration::from_millis(800));
    assert_eq!(drive(&engine, "r", 3), (3, 0));
}

#[test]
fn test_exception_and_response_time() {
    let (engine, _) = manual_engine(1_000);
    let mut ok = engine.entry("svc").unwrap();
    let mut failed = engine.entry("svc").unwrap();
    ok.exit_with(Duration::from_millis(20), false).unwrap();
    failed.exit_with(Duration::from_millis(40), true).unwrap();

    let stats = engine.node_stats("svc").unwrap();
    assert_eq!(stats.pass_qps, 2.0);
    assert_eq!(stats.success_qps, 2.0);
    assert_eq!(stats.exception_qps, 1.0);
    assert!((stats.avg_rt_ms - 30.0).abs() < 1e-9);
}

#[test]
fn test_custom_sample_count() {
    let config = EngineConfig {
        sample_count: 2,
        interval_ms: 1_000,
        ..EngineConfig::default()
    };
    let (engine, clock) = manual_engine_with(config, 0);
    engine.load_rules("r", vec![FlowRule::qps("r", 4.0)]).unwrap();
    assert_eq!(drive(&engine, "r", 4), (4, 0));

    clock.advance(Duration::from_millis(499));
    assert_eq!(drive(&engine, "r", 1), (0, 1));

    clock.advance(Duration::from_millis(501));
    assert_eq!(drive(&engine, "r", 4), (4, 0));
}

#[test]
fn test_all_node_stats_sorted() {
    let (engine, _) = manual_engine(1_000);
    for name in ["b", "a", "c"] {
        let _ = engine.entry(name).unwrap();
    }
    let names: Vec<String> = engine
        .all_node_stats()
        .into_iter()
        .map(|s| s.resource)
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}
