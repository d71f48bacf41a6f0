//! Bridge Metrics
//!
//! Observability for the routing flow:
//! - Routed requests by target kind (single, hybrid, fallback)
//! - Failovers, partial results, validation rejections, backpressure
//! - Per-platform request outcomes, tokens and latency
//! - Time spent in the routing decision

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::PlatformId;

// ============================================================================
// Histogram
// ============================================================================

/// Fixed-bucket histogram
#[derive(Debug)]
pub struct Histogram {
    /// Upper bucket bounds
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Histogram with the given upper bucket bounds (ascending)
    #[must_use]
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Latency buckets in milliseconds
    #[must_use]
    pub fn latency_default() -> Self {
        Self::new(vec![
            5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0,
            30_000.0, 60_000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        let Some(last) = self.buckets.len().checked_sub(1) else {
            return;
        };
        let index = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(last);
        self.counts[index].fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);

        let value = value.max(0.0) as u64;
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    /// Record a duration in milliseconds
    pub fn record_duration(&self, elapsed: Duration) {
        self.record(elapsed.as_secs_f64() * 1_000.0);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts: self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect(),
            total,
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 { sum as f64 / total as f64 } else { 0.0 },
        }
    }
}

/// Copy of a histogram's state
#[derive(Clone, Debug, PartialEq)]
pub struct HistogramSnapshot {
    buckets: Vec<f64>,
    counts: Vec<u64>,
    /// Values recorded
    pub total: u64,
    /// Largest value recorded
    pub max: u64,
    /// Mean of recorded values
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0;
        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }
        self.buckets.last().copied().unwrap_or(0.0)
    }

    /// Median
    #[must_use]
    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    /// 95th percentile
    #[must_use]
    pub fn p95(&self) -> f64 {
        self.percentile(0.95)
    }

    /// 99th percentile
    #[must_use]
    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter / Gauge
// ============================================================================

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Value that goes up and down
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Subtract one, saturating at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-platform metrics
// ============================================================================

/// Counters for one platform
#[derive(Debug)]
pub struct PlatformMetrics {
    /// Requests sent
    pub requests: Counter,
    /// Requests answered
    pub successes: Counter,
    /// Requests that failed
    pub failures: Counter,
    /// Tokens consumed
    pub tokens: Counter,
    /// Requests currently outstanding
    pub active: Gauge,
    /// Time until the platform answered
    pub latency: Histogram,
}

impl Default for PlatformMetrics {
    fn default() -> Self {
        Self {
            requests: Counter::default(),
            successes: Counter::default(),
            failures: Counter::default(),
            tokens: Counter::default(),
            active: Gauge::default(),
            latency: Histogram::latency_default(),
        }
    }
}

impl PlatformMetrics {
    fn summary(&self, platform: &PlatformId) -> PlatformSummary {
        let latency = self.latency.snapshot();
        let requests = self.requests.get();
        PlatformSummary {
            platform: platform.clone(),
            requests,
            successes: self.successes.get(),
            failures: self.failures.get(),
            error_rate: if requests > 0 {
                self.failures.get() as f64 / requests as f64
            } else {
                0.0
            },
            tokens: self.tokens.get(),
            active: self.active.get(),
            latency_p50_ms: latency.p50(),
            latency_p95_ms: latency.p95(),
            latency_p99_ms: latency.p99(),
        }
    }
}

/// Serializable view of one platform's metrics
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlatformSummary {
    /// Platform
    pub platform: PlatformId,
    /// Requests sent
    pub requests: u64,
    /// Requests answered
    pub successes: u64,
    /// Requests that failed
    pub failures: u64,
    /// failures / requests
    pub error_rate: f64,
    /// Tokens consumed
    pub tokens: u64,
    /// Outstanding requests
    pub active: u64,
    /// Latency p50
    pub latency_p50_ms: f64,
    /// Latency p95
    pub latency_p95_ms: f64,
    /// Latency p99
    pub latency_p99_ms: f64,
}

// ============================================================================
// Bridge metrics
// ============================================================================

/// Metrics for the whole bridge
#[derive(Debug)]
pub struct BridgeMetrics {
    platforms: RwLock<BTreeMap<PlatformId, Arc<PlatformMetrics>>>,

    /// `route` calls received
    pub requests: Counter,
    /// Requests answered by a single platform
    pub routed_single: Counter,
    /// Requests answered by a hybrid execution
    pub routed_hybrid: Counter,
    /// Decisions that found no eligible platform
    pub fallbacks: Counter,
    /// Retries on the next-ranked platform
    pub failovers: Counter,
    /// Hybrid results with a single contributor
    pub partial_results: Counter,
    /// Requests rejected before routing
    pub validation_rejections: Counter,
    /// Requests refused for lack of capacity
    pub backpressure: Counter,
    /// Requests that ended in an error response
    pub errors: Counter,
    /// Routes currently being processed
    pub active_routes: Gauge,
    /// Time spent in `Router::decide`, in milliseconds
    pub decision_time: Histogram,
    /// End-to-end route latency
    pub route_latency: Histogram,

    started_at: Instant,
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeMetrics {
    /// Empty metrics
    #[must_use]
    pub fn new() -> Self {
        Self {
            platforms: RwLock::new(BTreeMap::new()),
            requests: Counter::default(),
            routed_single: Counter::default(),
            routed_hybrid: Counter::default(),
            fallbacks: Counter::default(),
            failovers: Counter::default(),
            partial_results: Counter::default(),
            validation_rejections: Counter::default(),
            backpressure: Counter::default(),
            errors: Counter::default(),
            active_routes: Gauge::default(),
            decision_time: Histogram::new(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            route_latency: Histogram::latency_default(),
            started_at: Instant::now(),
        }
    }

    /// Metrics for `platform`, created on first use
    pub fn platform(&self, platform: &PlatformId) -> Arc<PlatformMetrics> {
        if let Some(metrics) = self.platforms.read().get(platform) {
            return Arc::clone(metrics);
        }
        Arc::clone(
            self.platforms
                .write()
                .entry(platform.clone())
                .or_default(),
        )
    }

    /// A request was handed to `platform`
    pub fn record_dispatch(&self, platform: &PlatformId) {
        let metrics = self.platform(platform);
        metrics.requests.inc();
        metrics.active.inc();
    }

    /// `platform` answered
    pub fn record_success(&self, platform: &PlatformId, elapsed: Duration, tokens: u64) {
        let metrics = self.platform(platform);
        metrics.successes.inc();
        metrics.active.dec();
        metrics.tokens.add(tokens);
        metrics.latency.record_duration(elapsed);
    }

    /// `platform` failed
    pub fn record_failure(&self, platform: &PlatformId) {
        let metrics = self.platform(platform);
        metrics.failures.inc();
        metrics.active.dec();
    }

    /// Time since the metrics were created
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Serializable snapshot
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let decision = self.decision_time.snapshot();
        let latency = self.route_latency.snapshot();
        let platforms = self
            .platforms
            .read()
            .iter()
            .map(|(id, m)| m.summary(id))
            .collect();

        MetricsSummary {
            uptime_secs: self.uptime().as_secs(),
            requests: self.requests.get(),
            routed_single: self.routed_single.get(),
            routed_hybrid: self.routed_hybrid.get(),
            fallbacks: self.fallbacks.get(),
            failovers: self.failovers.get(),
            partial_results: self.partial_results.get(),
            validation_rejections: self.validation_rejections.get(),
            backpressure: self.backpressure.get(),
            errors: self.errors.get(),
            active_routes: self.active_routes.get(),
            decision_p50_ms: decision.p50(),
            decision_p99_ms: decision.p99(),
            route_p50_ms: latency.p50(),
            route_p95_ms: latency.p95(),
            route_p99_ms: latency.p99(),
            platforms,
        }
    }
}

/// Serializable view of [`BridgeMetrics`]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricsSummary {
    /// Seconds since start
    pub uptime_secs: u64,
    /// `route` calls received
    pub requests: u64,
    /// Single-platform answers
    pub routed_single: u64,
    /// Hybrid answers
    pub routed_hybrid: u64,
    /// Fallback decisions
    pub fallbacks: u64,
    /// Failover retries
    pub failovers: u64,
    /// Partial hybrid results
    pub partial_results: u64,
    /// Validation rejections
    pub validation_rejections: u64,
    /// Backpressure refusals
    pub backpressure: u64,
    /// Error responses
    pub errors: u64,
    /// Routes in progress
    pub active_routes: u64,
    /// Decision time p50
    pub decision_p50_ms: f64,
    /// Decision time p99
    pub decision_p99_ms: f64,
    /// Route latency p50
    pub route_p50_ms: f64,
    /// Route latency p95
    pub route_p95_ms: f64,
    /// Route latency p99
    pub route_p99_ms: f64,
    /// Per-platform metrics
    pub platforms: Vec<PlatformSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_percentiles() {
        let histogram = Histogram::new(vec![10.0, 100.0, 1_000.0]);
        for _ in 0..90 {
            histogram.record(5.0);
        }
        for _ in 0..10 {
            histogram.record(500.0);
        }
        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.total, 100);
        assert!((snapshot.p50() - 10.0).abs() < f64::EPSILON);
        assert!((snapshot.p95() - 1_000.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.max, 500);
    }

    #[test]
    fn test_histogram_overflow_lands_in_last_bucket() {
        let histogram = Histogram::new(vec![1.0, 2.0]);
        histogram.record(99.0);
        assert!((histogram.snapshot().p99() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_histogram() {
        let snapshot = Histogram::latency_default().snapshot();
        assert!(snapshot.p50().abs() < f64::EPSILON);
        assert!(snapshot.mean.abs() < f64::EPSILON);
    }

    #[test]
    fn test_gauge_saturates() {
        let gauge = Gauge::default();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_platform_summary() {
        let metrics = BridgeMetrics::new();
        let alpha = PlatformId::from("alpha");
        metrics.record_dispatch(&alpha);
        metrics.record_success(&alpha, Duration::from_millis(40), 120);
        metrics.record_dispatch(&alpha);
        metrics.record_failure(&alpha);

        let summary = metrics.summary();
        assert_eq!(summary.platforms.len(), 1);
        let platform = &summary.platforms[0];
        assert_eq!(platform.requests, 2);
        assert_eq!(platform.successes, 1);
        assert_eq!(platform.tokens, 120);
        assert_eq!(platform.active, 0);
        assert!((platform.error_rate - 0.5).abs() < f64::EPSILON);
    }
}
