//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from FlowSentry,
//! allowing users to import them with a single `use flowsentry::prelude::*;`
//! statement instead of importing each type individually.

// Core types - always available
pub use crate::engine::Engine;
pub use crate::entry::Entry;
pub use crate::error::{BlockError, BlockKind, FlowSentryError, GuardError};
pub use crate::rule::{ControlBehavior, FlowRule, Grade};

// Configuration
pub use crate::config::{EngineConfig, RuleFile};

// Metrics
pub use crate::metrics::{MetricExporter, MetricSink, MetricSnapshot, TracingMetricSink};

// Feature-gated exports
#[cfg(feature = "macros")]
pub use crate::sentinel_resource;

#[cfg(feature = "monitoring")]
pub use crate::telemetry::PrometheusMetricSink;
