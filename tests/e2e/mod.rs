//! E2E测试模块
//!
//! 覆盖完整的准入场景

mod async_cancellation;
mod hello_world_qps;
mod rate_limiter_queueing;
mod relate_strategy;
