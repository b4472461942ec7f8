//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for flowsentry.
//!
//! Every default and bound used by the engine lives here so that rule
//! validation, the statistics window and the configuration loaders agree.

// ============================================================================
// Admission weight
// ============================================================================

/// Maximum weight a single admission may request.
///
/// Mirrors the cost ceiling of the limiter layer: one call must not be able to
/// book an unbounded number of units.
pub const MAX_WEIGHT: u32 = 1_000_000;

/// Minimum weight a single admission may request.
pub const MIN_WEIGHT: u32 = 1;

// ============================================================================
// Statistics window
// ============================================================================

/// Default number of sub-buckets in the sliding second window.
///
/// 10 buckets of 100ms each. A reading sums the current bucket and the
/// `sample_count - 1` before it, so the oldest sliver of the exact interval
/// (less than one bucket) is not counted: QPS may be under-read by at most one
/// bucket of traffic.
pub const DEFAULT_SAMPLE_COUNT: u32 = 10;

/// Default length of the sliding window in milliseconds.
pub const DEFAULT_INTERVAL_MS: u64 = 1_000;

/// Upper bound for `sample_count`.
pub const MAX_SAMPLE_COUNT: u32 = 1_000;

/// Number of one-second buckets kept for metric export.
pub const MINUTE_SAMPLE_COUNT: u32 = 60;

/// Length of the metric export window in milliseconds.
pub const MINUTE_INTERVAL_MS: u64 = 60_000;

/// Nanoseconds per millisecond. Rate limiter spacing is kept in nanoseconds.
pub const NANOS_PER_MILLI: u64 = 1_000_000;

// ============================================================================
// Warm-up
// ============================================================================

/// Default cold factor: a cold resource starts at `threshold / 3`.
pub const DEFAULT_COLD_FACTOR: f64 = 3.0;

/// Default warm-up period (10 seconds).
pub const DEFAULT_WARM_UP_PERIOD_SECS: u64 = 10;

/// Default pass QPS at or below which a resource is considered idle.
pub const DEFAULT_IDLE_QPS: f64 = 0.0;

// ============================================================================
// Rate limiter
// ============================================================================

/// Default maximum queueing time for rate limiter behaviours (500ms).
pub const DEFAULT_MAX_QUEUEING_TIME_MS: u64 = 500;

// ============================================================================
// Metric export
// ============================================================================

/// Default interval between metric flushes (1 second).
pub const DEFAULT_METRIC_FLUSH_INTERVAL_SECS: u64 = 1;
