//! E2E: 关联资源限流

use crate::common::{drive, manual_engine};
use flowsentry::{BlockKind, FlowRule};

#[test]
fn test_write_limited_by_read_traffic() {
    let (engine, _) = manual_engine(1_000_000);
    engine
        .load_rules("write", vec![FlowRule::qps("write", 5.0).relate_to("read")])
        .unwrap();

    assert_eq!(drive(&engine, "read", 4), (4, 0));
    assert!(engine.entry("write").is_ok());

    drive(&engine, "read", 1);
    let block = engine.entry("write").unwrap_err();
    assert_eq!(block.kind(), BlockKind::Qps);
    assert_eq!(block.resource(), "write");

    // 拒绝记在被限流的资源上
    assert_eq!(engine.node_stats("write").unwrap().block_qps, 1.0);
    assert_eq!(engine.node_stats("read").unwrap().block_qps, 0.0);
}

#[test]
fn test_unseen_ref_resource_passes() {
    let (engine, _) = manual_engine(1_000_000);
    engine
        .load_rules("write", vec![FlowRule::qps("write", 0.0).relate_to("never")])
        .unwrap();
    assert_eq!(drive(&engine, "write", 3), (3, 0));
}
