//! E2E: 匀速排队

use crate::common::{drive, manual_engine};
use flowsentry::{BlockKind, ControlBehavior, FlowRule};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

fn rate_limited(resource: &str, qps: f64, max_wait: Duration) -> FlowRule {
    FlowRule::qps(resource, qps)
        .with_behavior(ControlBehavior::RateLimiter)
        .with_max_queueing_time(max_wait)
}

#[test]
fn test_sync_calls_are_spaced_and_queue_bounded() {
    let (engine, _) = manual_engine(1_000_000);
    engine
        .load_rules(
            "queue",
            vec![rate_limited("queue", 100.0, Duration::from_millis(30))],
        )
        .unwrap();

    // 间隔 10ms：0、10、20、30ms 可排队，第五个超过 30ms 被拒绝
    for expected_wait in [0u64, 10, 20, 30] {
        let started = Instant::now();
        let mut entry = engine.entry("queue").unwrap();
        assert!(started.elapsed() >= Duration::from_millis(expected_wait));
        entry.exit().unwrap();
    }

    let block = engine.entry("queue").unwrap_err();
    assert_eq!(block.kind(), BlockKind::QueueTimeout);
}

#[test]
fn test_queue_drains_as_time_passes() {
    let (engine, clock) = manual_engine(1_000_000);
    engine
        .load_rules(
            "queue",
            vec![rate_limited("queue", 100.0, Duration::ZERO)],
        )
        .unwrap();

    assert!(engine.entry("queue").is_ok());
    assert!(engine.entry("queue").is_err());

    clock.advance(Duration::from_millis(10));
    let started = Instant::now();
    assert!(engine.entry("queue").is_ok());
    assert!(started.elapsed() < Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn test_async_waiters_are_released_one_interval_apart() {
    let (engine, _) = manual_engine(1_000_000);
    engine
        .load_rules(
            "queue",
            vec![rate_limited("queue", 10.0, Duration::from_millis(500))],
        )
        .unwrap();

    let started = tokio::time::Instant::now();
    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let engine = engine.clone();
        tasks.spawn(async move {
            engine
                .entry_async("queue")
                .await
                .map(|_entry| started.elapsed())
                .map_err(|block| block.kind())
        });
    }

    let mut waits = Vec::new();
    let mut blocked = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(waited) => waits.push(waited),
            Err(kind) => blocked.push(kind),
        }
    }

    // 1 个立即通过，5 个每隔 100ms 放行，2 个超出 500ms 被拒绝
    assert_eq!(waits.len(), 6);
    assert_eq!(blocked, vec![BlockKind::QueueTimeout; 2]);

    waits.sort();
    for (i, waited) in waits.iter().enumerate() {
        let expected = Duration::from_millis(100 * i as u64);
        assert!(*waited >= expected, "waiter {} released after {:?}", i, waited);
        assert!(*waited < expected + Duration::from_millis(10));
    }
}

#[test]
fn test_high_rate_keeps_sub_millisecond_spacing() {
    let (engine, clock) = manual_engine(1_000_000);
    engine
        .load_rules("fast", vec![rate_limited("fast", 5_000.0, Duration::ZERO)])
        .unwrap();

    // 时钟不动时只有第一个请求能通过
    assert_eq!(drive(&engine, "fast", 100_000), (1, 99_999));

    // 每 10 微秒一个请求，持续一秒，恰好按 200 微秒间隔放行
    clock.advance(Duration::from_secs(1));
    let mut passed = 0;
    for _ in 0..100_000 {
        if let Ok(mut entry) = engine.entry("fast") {
            passed += 1;
            entry.exit().unwrap();
        }
        clock.advance(Duration::from_micros(10));
    }
    assert_eq!(passed, 5_000);
}

#[test]
fn test_slot_returned_when_later_rule_blocks() {
    let (engine, clock) = manual_engine(1_000_000);
    engine
        .load_rules(
            "mixed",
            vec![
                rate_limited("mixed", 10.0, Duration::ZERO),
                FlowRule::concurrency("mixed", 1),
            ],
        )
        .unwrap();

    let mut held = engine.entry("mixed").unwrap();
    clock.advance(Duration::from_millis(200));
    let block = engine.entry("mixed").unwrap_err();
    assert_eq!(block.kind(), BlockKind::Concurrency);

    held.exit().unwrap();
    clock.advance(Duration::from_millis(50));

    // 被拒绝的请求没有占住排队位置
    let mut next = engine.entry("mixed").unwrap();
    next.exit().unwrap();
    assert_eq!(engine.node_stats("mixed").unwrap().in_flight, 0);
}
