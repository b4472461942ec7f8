//! E2E: HelloWorld 每秒 20 个请求

use crate::common::{drive, manual_engine};
use flowsentry::{BlockKind, FlowRule};
use std::time::Duration;

#[test]
fn test_twenty_five_calls_in_one_window() {
    let (engine, _) = manual_engine(1_700_000_000_000);
    engine
        .load_rules("HelloWorld", vec![FlowRule::qps("HelloWorld", 20.0)])
        .unwrap();

    let mut passed = 0;
    let mut blocked = Vec::new();
    for _ in 0..25 {
        match engine.entry("HelloWorld") {
            Ok(mut entry) => {
                passed += 1;
                entry.exit().unwrap();
            }
            Err(block) => blocked.push(block),
        }
    }

    assert_eq!(passed, 20);
    assert_eq!(blocked.len(), 5);
    assert!(blocked.iter().all(|b| b.kind() == BlockKind::Qps));
    assert!(blocked.iter().all(|b| b.rule().threshold == 20.0));
}

#[test]
fn test_at_most_threshold_per_rolling_second() {
    let (engine, clock) = manual_engine(1_700_000_000_000);
    engine
        .load_rules("HelloWorld", vec![FlowRule::qps("HelloWorld", 20.0)])
        .unwrap();

    // 每 50ms 发起 3 个请求，持续 5 秒
    let mut admitted_at: Vec<u64> = Vec::new();
    for _ in 0..100 {
        for _ in 0..3 {
            if let Ok(mut entry) = engine.entry("HelloWorld") {
                admitted_at.push(entry.created_at_ms());
                entry.exit().unwrap();
            }
        }
        clock.advance(Duration::from_millis(50));
    }

    // 任意对齐到子桶的一秒内不超过阈值
    let start = 1_700_000_000_000u64;
    for offset in (0..4_000).step_by(100) {
        let from = start + offset;
        let count = admitted_at
            .iter()
            .filter(|&&t| t >= from && t < from + 1_000)
            .count();
        assert!(count <= 20, "window at {} admitted {}", from, count);
    }
    assert!(admitted_at.len() >= 80);
}

#[test]
fn test_recovers_after_window() {
    let (engine, clock) = manual_engine(1_000);
    engine
        .load_rules("HelloWorld", vec![FlowRule::qps("HelloWorld", 20.0)])
        .unwrap();
    assert_eq!(drive(&engine, "HelloWorld", 25), (20, 5));
    clock.advance(Duration::from_secs(1));
    assert_eq!(drive(&engine, "HelloWorld", 25), (20, 5));
}
