//! 指标导出集成测试

use crate::common::manual_engine;
use async_trait::async_trait;
use flowsentry::{
    Engine, FlowRule, FlowSentryError, MetricExporter, MetricSink, MetricSnapshot,
    TracingMetricSink,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingSink {
    snapshots: Mutex<Vec<MetricSnapshot>>,
}

#[async_trait]
impl MetricSink for RecordingSink {
    async fn export(&self, snapshots: &[MetricSnapshot]) -> Result<(), FlowSentryError> {
        self.snapshots.lock().extend_from_slice(snapshots);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

struct FailingSink;

#[async_trait]
impl MetricSink for FailingSink {
    async fn export(&self, _snapshots: &[MetricSnapshot]) -> Result<(), FlowSentryError> {
        Err(FlowSentryError::Config("sink offline".to_string()))
    }
}

#[test]
fn test_snapshots_per_completed_second() {
    let (engine, clock) = manual_engine(100_000);
    engine.load_rules("HelloWorld", vec![FlowRule::qps("HelloWorld", 20.0)]).unwrap();

    for _ in 0..25 {
        if let Ok(mut entry) = engine.entry("HelloWorld") {
            entry.exit_with(Duration::from_millis(4), false).unwrap();
        }
    }
    clock.advance(Duration::from_secs(1));
    for _ in 0..3 {
        let mut entry = engine.entry("HelloWorld").unwrap();
        entry.exit_with(Duration::from_millis(2), true).unwrap();
    }
    clock.advance(Duration::from_secs(1));

    let snapshots = engine.metric_snapshots_since(0);
    assert_eq!(snapshots.len(), 2);

    let first = &snapshots[0];
    assert_eq!(first.timestamp_ms, 100_000);
    assert_eq!(first.resource, "HelloWorld");
    assert_eq!((first.pass, first.block, first.success), (20, 5, 20));
    assert!((first.avg_rt_ms - 4.0).abs() < 1e-9);
    assert_eq!(first.to_line(), "100000|HelloWorld|20|5|20|0|4.00");

    let second = &snapshots[1];
    assert_eq!(second.timestamp_ms, 101_000);
    assert_eq!(second.exception, 3);

    assert_eq!(engine.metric_snapshots_since(100_000).len(), 1);
}

#[test]
fn test_idle_seconds_are_skipped() {
    let (engine, clock) = manual_engine(50_000);
    let _ = engine.entry("r").unwrap();
    clock.advance(Duration::from_secs(5));
    let _ = engine.entry("r").unwrap();
    clock.advance(Duration::from_secs(1));

    let stamps: Vec<u64> = engine
        .metric_snapshots_since(0)
        .into_iter()
        .map(|s| s.timestamp_ms)
        .collect();
    assert_eq!(stamps, vec![50_000, 55_000]);
}

#[tokio::test]
async fn test_failing_sink_does_not_stop_others() {
    let (engine, clock) = manual_engine(10_000);
    let _ = engine.entry("r").unwrap();
    clock.advance(Duration::from_secs(1));

    let recording = Arc::new(RecordingSink::default());
    let exporter = MetricExporter::new(engine.clone(), Duration::from_secs(1))
        .with_sink(Arc::new(FailingSink))
        .with_sink(Arc::new(TracingMetricSink))
        .with_sink(recording.clone());

    let mut last = 0;
    assert_eq!(exporter.flush(&mut last).await, 1);
    assert_eq!(recording.snapshots.lock().len(), 1);
}

#[tokio::test]
async fn test_spawned_exporter_flushes_on_stop() {
    let (engine, clock) = manual_engine(20_000);
    let _ = engine.entry("bg").unwrap();
    clock.advance(Duration::from_secs(1));

    let recording = Arc::new(RecordingSink::default());
    let handle = MetricExporter::new(engine.clone(), Duration::from_millis(10))
        .with_sink(recording.clone())
        .spawn();

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop().await;

    let received = recording.snapshots.lock().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].resource, "bg");
}

#[test]
fn test_exporter_from_default_config() {
    let engine = Engine::new();
    assert!(MetricExporter::from_engine_config(engine).is_some());
}
