//! HelloWorld 快速开始
//!
//! 资源 HelloWorld 每秒最多通过 20 个请求。运行 3 秒后打印统计并退出，
//! 每秒指标通过 tracing 输出。
//!
//! 运行：`cargo run --bin hello_world --features telemetry`

use flowsentry::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

const RESOURCE: &str = "HelloWorld";
const RUN_FOR: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    flowsentry::init_logging("info")?;

    let engine = Engine::new();
    init_flow_rules(&engine)?;

    let exporter = MetricExporter::new(engine.clone(), Duration::from_secs(1))
        .with_sink(Arc::new(TracingMetricSink))
        .spawn();

    let started = Instant::now();
    let (mut passed, mut blocked) = (0u64, 0u64);
    while started.elapsed() < RUN_FOR {
        match engine.entry(RESOURCE) {
            Ok(mut entry) => {
                // 被保护的逻辑
                println!("hello world");
                passed += 1;
                entry.exit()?;
            }
            Err(_) => {
                // 处理被流控的逻辑
                println!("blocked!");
                blocked += 1;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    exporter.stop().await;
    info!("运行结束: passed={}, blocked={}", passed, blocked);
    Ok(())
}

fn init_flow_rules(engine: &Engine) -> Result<(), FlowSentryError> {
    // 每秒最多 20 个请求
    let rule = FlowRule::qps(RESOURCE, 20.0);
    engine.load_rules(RESOURCE, vec![rule])
}
