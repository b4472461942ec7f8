//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! FlowSentry - In-process Flow Control Engine
//!
//! Marks named resources, tracks their throughput in sliding windows and makes
//! a fast admit/block decision on every call.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use flowsentry::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`Engine`] - Rule store, statistics and the admission gate
//! - [`Entry`] - Token for an admitted call, exited exactly once
//! - [`FlowRule`] - QPS / concurrency rule with its control behavior
//! - [`BlockError`] - Returned when a rule rejects the call
//! - [`FlowSentryError`] - Validation, misuse and configuration errors
//!
//! ## Controllers
//!
//! QPS direct reject, concurrency, warm-up, rate limiter (uniform queueing)
//! and warm-up rate limiter.
//!
//! ## Extensions (feature-gated)
//!
//! - Logging initialisation (requires `telemetry` feature)
//! - Prometheus metric sink (requires `monitoring` feature)
//! - `#[sentinel_resource]` attribute (requires `macros` feature)
//!
//! # Examples
//!
//! ```rust
//! use flowsentry::prelude::*;
//!
//! let engine = Engine::new();
//! engine
//!     .load_rules("HelloWorld", vec![FlowRule::qps("HelloWorld", 20.0)])
//!     .unwrap();
//!
//! let mut passed = 0;
//! for _ in 0..25 {
//!     if let Ok(mut entry) = engine.entry("HelloWorld") {
//!         passed += 1;
//!         entry.exit().unwrap();
//!     }
//! }
//! assert!(passed <= 20);
//! ```

pub mod prelude;

pub mod clock;
pub mod config;
pub mod constants;
pub mod controllers;
pub mod engine;
pub mod entry;
pub mod error;
pub mod metrics;
pub mod rule;
pub mod rule_store;
pub mod statistics;
#[cfg(any(feature = "telemetry", feature = "monitoring"))]
pub mod telemetry;

// 重新导出常用类型
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigFormat, EngineConfig, MetricConfig, RuleFile};
pub use controllers::{Admission, Reservation, TrafficController};
pub use engine::Engine;
pub use entry::Entry;
pub use error::{BlockError, BlockKind, FlowSentryError, GuardError};
pub use metrics::{ExporterHandle, MetricExporter, MetricSink, MetricSnapshot, TracingMetricSink};
pub use rule::{ControlBehavior, FlowRule, Grade, Strategy};
pub use rule_store::{RuleSet, RuleStore};
pub use statistics::{NodeStats, ResourceNode};
#[cfg(feature = "telemetry")]
pub use telemetry::init_logging;
#[cfg(feature = "monitoring")]
pub use telemetry::PrometheusMetricSink;

#[cfg(feature = "macros")]
pub use flowsentry_macros::sentinel_resource;
