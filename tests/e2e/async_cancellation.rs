//! E2E: 排队中的异步请求被取消

use crate::common::manual_engine;
use flowsentry::{ControlBehavior, FlowRule};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_cancelled_wait_returns_reservation() {
    let (engine, _) = manual_engine(1_000_000);
    engine
        .load_rules(
            "slow",
            vec![FlowRule::qps("slow", 10.0)
                .with_behavior(ControlBehavior::RateLimiter)
                .with_max_queueing_time(Duration::from_millis(500))],
        )
        .unwrap();

    let mut first = engine.entry_async("slow").await.unwrap();

    // 第二个请求需要等待 100ms，10ms 后放弃
    let cancelled =
        tokio::time::timeout(Duration::from_millis(10), engine.entry_async("slow")).await;
    assert!(cancelled.is_err());

    let stats = engine.node_stats("slow").unwrap();
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.pass_qps, 1.0);

    first.exit().unwrap();
    assert_eq!(engine.node_stats("slow").unwrap().in_flight, 0);

    // 被取消的预留已归还，下一个请求仍然只需等待一个间隔
    let started = tokio::time::Instant::now();
    let mut next = engine.entry_async("slow").await.unwrap();
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_millis(150), "waited {:?}", waited);
    next.exit().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_wait_releases_concurrency() {
    let (engine, _) = manual_engine(1_000_000);
    engine
        .load_rules(
            "mixed",
            vec![
                FlowRule::qps("mixed", 10.0)
                    .with_behavior(ControlBehavior::RateLimiter)
                    .with_max_queueing_time(Duration::from_millis(500)),
                FlowRule::concurrency("mixed", 2),
            ],
        )
        .unwrap();

    let _held = engine.entry_async("mixed").await.unwrap();
    let waiter = tokio::time::timeout(Duration::from_millis(10), engine.entry_async("mixed"));
    assert!(waiter.await.is_err());

    let stats = engine.node_stats("mixed").unwrap();
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.block_qps, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_guard_async_not_run_when_cancelled() {
    let (engine, _) = manual_engine(1_000_000);
    engine
        .load_rules(
            "guarded",
            vec![FlowRule::qps("guarded", 10.0)
                .with_behavior(ControlBehavior::RateLimiter)
                .with_max_queueing_time(Duration::from_millis(500))],
        )
        .unwrap();

    let _first = engine.entry("guarded").unwrap();

    let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = ran.clone();
    let guarded = engine.guard_async("guarded", 1, move || async move {
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok::<_, String>(())
    });
    assert!(tokio::time::timeout(Duration::from_millis(10), guarded)
        .await
        .is_err());
    assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(engine.node_stats("guarded").unwrap().in_flight, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_waiter_returns_only_its_own_slot() {
    let (engine, _) = manual_engine(1_000_000);
    engine
        .load_rules(
            "weighted",
            vec![FlowRule::qps("weighted", 10.0)
                .with_behavior(ControlBehavior::RateLimiter)
                .with_max_queueing_time(Duration::from_secs(1))],
        )
        .unwrap();

    let _first = engine.entry_async("weighted").await.unwrap();

    // 权重 1 排到 +100ms，权重 5 排到 +600ms
    let light = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.entry_async("weighted").await.is_ok() })
    };
    let heavy = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.entry_async_with("weighted", 5).await.is_ok() })
    };
    while engine.node_stats("weighted").unwrap().in_flight < 7 {
        tokio::task::yield_now().await;
    }

    light.abort();
    assert!(light.await.unwrap_err().is_cancelled());
    assert_eq!(engine.node_stats("weighted").unwrap().in_flight, 6);

    // 重量请求仍占着 +600ms，下一个请求排在它之后
    let started = tokio::time::Instant::now();
    let mut next = engine.entry_async("weighted").await.unwrap();
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(600), "waited {:?}", waited);
    assert!(waited < Duration::from_millis(650), "waited {:?}", waited);
    next.exit().unwrap();

    assert!(heavy.await.unwrap());
}
