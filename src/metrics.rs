//! Observability: request ids, timing spans, and per-metric latency
//! histograms summarised at p50/p95/p99.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// New opaque request id attached to an analysis run.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Measures elapsed time from creation until `finish`.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    /// Record the elapsed time and return it in milliseconds.
    pub fn finish(self) -> f64 {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.registry.record(self.name, elapsed_ms);
        elapsed_ms
    }
}

/// Fixed-capacity window of the most recent samples.
struct SampleWindow {
    samples: Vec<f64>,
    next: usize,
    filled: usize,
    total: u64,
}

impl SampleWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)],
            next: 0,
            filled: 0,
            total: 0,
        }
    }

    fn push(&mut self, value: f64) {
        let capacity = self.samples.len();
        self.samples[self.next] = value;
        self.next = (self.next + 1) % capacity;
        self.filled = (self.filled + 1).min(capacity);
        self.total += 1;
    }

    fn sorted(&self) -> Vec<f64> {
        let mut sorted = self.samples[..self.filled].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sorted
    }

    fn percentile_of(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let idx = ((p / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }
}

/// Histograms for every named metric, in milliseconds.
pub struct MetricsRegistry {
    windows: Mutex<HashMap<&'static str, SampleWindow>>,
    window_capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_capacity(512)
    }

    pub fn with_capacity(window_capacity: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window_capacity,
        }
    }

    pub fn record(&self, name: &'static str, value_ms: f64) {
        self.windows
            .lock()
            .entry(name)
            .or_insert_with(|| SampleWindow::new(self.window_capacity))
            .push(value_ms);
        tracing::trace!(metric = name, value_ms, "metric_recorded");
    }

    pub fn record_duration(&self, name: &'static str, elapsed: Duration) {
        self.record(name, elapsed.as_secs_f64() * 1000.0);
    }

    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan {
            name,
            start: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    /// Total samples ever recorded for `name`.
    pub fn count(&self, name: &str) -> u64 {
        self.windows.lock().get(name).map(|w| w.total).unwrap_or(0)
    }

    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        self.windows
            .lock()
            .get(name)
            .map(|w| SampleWindow::percentile_of(&w.sorted(), p))
            .unwrap_or(0.0)
    }

    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        let windows = self.windows.lock();
        windows
            .iter()
            .map(|(&name, window)| {
                let sorted = window.sorted();
                (
                    name.to_string(),
                    MetricSummary {
                        p50_ms: SampleWindow::percentile_of(&sorted, 50.0),
                        p95_ms: SampleWindow::percentile_of(&sorted, 95.0),
                        p99_ms: SampleWindow::percentile_of(&sorted, 99.0),
                        max_ms: sorted.last().copied().unwrap_or(0.0),
                        count: window.total,
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricSummary {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub count: u64,
}

/// Well-known metric names.
pub mod metric_names {
    pub const DIAGNOSE_DONE: &str = "t_diagnose_done";
    pub const RECOMMEND_DONE: &str = "t_recommend_done";
    pub const ANALYSIS_DONE: &str = "t_analysis_done";
    pub const ANALYSIS_TIMEOUT: &str = "analysis_timeout";
    pub const EXTRACTION_FALLBACK: &str = "extraction_fallback";
    pub const TRANSLATE_REMOTE: &str = "t_translate_remote";
    pub const TRANSLATE_FAILED: &str = "translate_failed";
    pub const CACHE_PERSIST: &str = "t_cache_persist";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_samples() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record("latency", v as f64);
        }
        assert_eq!(registry.count("latency"), 100);
        assert_eq!(registry.percentile("latency", 50.0), 51.0);
        assert_eq!(registry.percentile("latency", 99.0), 99.0);
        assert_eq!(registry.percentile("missing", 50.0), 0.0);
    }

    #[test]
    fn window_keeps_latest_samples() {
        let registry = MetricsRegistry::with_capacity(4);
        for v in [1000.0, 1.0, 2.0, 3.0, 4.0] {
            registry.record("x", v);
        }
        let summary = registry.summary();
        let x = &summary["x"];
        assert_eq!(x.count, 5);
        assert_eq!(x.max_ms, 4.0);
    }

    #[test]
    fn span_records_on_finish() {
        let registry = Arc::new(MetricsRegistry::new());
        let span = registry.span(metric_names::DIAGNOSE_DONE);
        let elapsed = span.finish();
        assert!(elapsed >= 0.0);
        assert_eq!(registry.count(metric_names::DIAGNOSE_DONE), 1);
    }
}
