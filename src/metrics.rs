//! Metrics recording and text exposition
//!
//! Counters and gauges are lock-free atomics; histograms keep the most
//! recent 1,000 samples in a ring buffer behind a single lock and summarize
//! to count/mean/p50/p95/p99. [`MetricsRecorder::render`] emits the text
//! exposition format understood by pull-based scrapers.
//!
//! Components take an `Arc<MetricsRecorder>` by injection; [`global`] is
//! the documented process-wide default for callers that do not care to wire
//! their own.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Number of samples a histogram retains.
pub const HISTOGRAM_CAPACITY: usize = 1000;

/// Summary of a bounded histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    /// Samples currently retained.
    pub count: usize,
    /// Arithmetic mean of retained samples.
    pub mean: f64,
    /// Median.
    pub p50: f64,
    /// 95th percentile.
    pub p95: f64,
    /// 99th percentile.
    pub p99: f64,
}

#[derive(Debug, Default)]
struct Histogram {
    samples: Mutex<VecDeque<f64>>,
}

impl Histogram {
    fn observe(&self, sample: f64) {
        let mut samples = self.samples.lock();
        if samples.len() == HISTOGRAM_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    fn summary(&self) -> Option<HistogramSummary> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        Some(HistogramSummary {
            count,
            mean,
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
        })
    }

    fn sum(&self) -> f64 {
        self.samples.lock().iter().sum()
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// In-memory metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: DashMap<String, Arc<AtomicU64>>,
    gauges: DashMap<String, Arc<AtomicU64>>,
    histograms: DashMap<String, Arc<Histogram>>,
}

impl MetricsRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `by` to a counter, creating it at zero on first use.
    pub fn incr_counter(&self, name: &str, by: u64) {
        let counter = self
            .counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        counter.fetch_add(by, Ordering::Relaxed);
    }

    /// Current counter value; zero when never incremented.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Set a gauge to an absolute value.
    pub fn set_gauge(&self, name: &str, value: f64) {
        let gauge = self
            .gauges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        gauge.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Current gauge value, if ever set.
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges
            .get(name)
            .map(|g| f64::from_bits(g.load(Ordering::Relaxed)))
    }

    /// Record a histogram sample, evicting the oldest beyond
    /// [`HISTOGRAM_CAPACITY`].
    pub fn observe(&self, name: &str, sample: f64) {
        let histogram = self
            .histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::default()))
            .clone();
        histogram.observe(sample);
    }

    /// Summarize a histogram, `None` when it has no samples.
    pub fn histogram_summary(&self, name: &str) -> Option<HistogramSummary> {
        self.histograms.get(name).and_then(|h| h.summary())
    }

    /// Render every metric in text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();

        let mut counters: Vec<(String, u64)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        counters.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in counters {
            let name = sanitize(&name);
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, value));
        }

        let mut gauges: Vec<(String, f64)> = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), f64::from_bits(e.value().load(Ordering::Relaxed))))
            .collect();
        gauges.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in gauges {
            let name = sanitize(&name);
            output.push_str(&format!("# TYPE {} gauge\n", name));
            output.push_str(&format!("{} {}\n", name, value));
        }

        let mut histograms: Vec<(String, Arc<Histogram>)> = self
            .histograms
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        histograms.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, histogram) in histograms {
            let summary = match histogram.summary() {
                Some(summary) => summary,
                None => continue,
            };
            let name = sanitize(&name);
            output.push_str(&format!("# TYPE {} summary\n", name));
            output.push_str(&format!("{}{{quantile=\"0.5\"}} {}\n", name, summary.p50));
            output.push_str(&format!("{}{{quantile=\"0.95\"}} {}\n", name, summary.p95));
            output.push_str(&format!("{}{{quantile=\"0.99\"}} {}\n", name, summary.p99));
            output.push_str(&format!("{}_sum {}\n", name, histogram.sum()));
            output.push_str(&format!("{}_count {}\n", name, summary.count));
        }

        output
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Process-wide default recorder.
pub fn global() -> Arc<MetricsRecorder> {
    static GLOBAL: once_cell::sync::Lazy<Arc<MetricsRecorder>> =
        once_cell::sync::Lazy::new(|| Arc::new(MetricsRecorder::new()));
    GLOBAL.clone()
}
