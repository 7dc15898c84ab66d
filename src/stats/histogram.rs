//! Read latency histogram using HdrHistogram
//!
//! Tracks the end-to-end latency of dispatched reads, from the call into the
//! dispatcher until the aggregated result is back, with 3 significant digits
//! from 1 nanosecond up to 1 hour.
//!
//! # Example
//!
//! ```
//! use fanread::stats::histogram::LatencyHistogram;
//! use std::time::Duration;
//!
//! let mut hist = LatencyHistogram::new()?;
//! hist.record(Duration::from_micros(100));
//! hist.record(Duration::from_micros(200));
//!
//! let p50 = hist.percentile(50.0).unwrap();
//! assert!(p50 >= Duration::from_micros(99));
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::Result;
use anyhow::Context;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::time::Duration;

/// Highest trackable latency: 1 hour in nanoseconds
const MAX_LATENCY_NS: u64 = 3_600_000_000_000;

/// Latency histogram wrapper
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

/// Percentile summary in microseconds, ready for text or JSON output
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min_us: f64,
    pub mean_us: f64,
    pub p50_us: f64,
    pub p99_us: f64,
    pub p999_us: f64,
    pub max_us: f64,
}

impl LatencyHistogram {
    /// Create an empty histogram
    pub fn new() -> Result<Self> {
        let histogram = Histogram::new_with_bounds(1, MAX_LATENCY_NS, 3)
            .context("Failed to create latency histogram")?;
        Ok(Self { histogram })
    }

    /// Record one latency sample, clamped to the trackable range
    #[inline]
    pub fn record(&mut self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(MAX_LATENCY_NS);
        let value = nanos.clamp(1, MAX_LATENCY_NS);
        // In range after clamping, so recording cannot fail
        let _ = self.histogram.record(value);
    }

    /// Latency at `percentile` (0.0 - 100.0), or None if empty
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        Some(Duration::from_nanos(self.histogram.value_at_percentile(percentile)))
    }

    pub fn min(&self) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        Some(Duration::from_nanos(self.histogram.min()))
    }

    pub fn max(&self) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        Some(Duration::from_nanos(self.histogram.max()))
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        Some(Duration::from_nanos(self.histogram.mean() as u64))
    }

    /// Number of samples recorded
    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.len() == 0
    }

    /// Fold another histogram's samples into this one
    ///
    /// Used to combine the per-caller histograms of a benchmark run.
    pub fn merge(&mut self, other: &LatencyHistogram) -> Result<()> {
        self.histogram
            .add(&other.histogram)
            .context("Failed to merge latency histograms")
    }

    /// Summarize into the percentiles the benchmark reports
    pub fn summary(&self) -> LatencySummary {
        if self.is_empty() {
            return LatencySummary::default();
        }
        let us = |nanos: u64| nanos as f64 / 1000.0;
        LatencySummary {
            count: self.len(),
            min_us: us(self.histogram.min()),
            mean_us: self.histogram.mean() / 1000.0,
            p50_us: us(self.histogram.value_at_percentile(50.0)),
            p99_us: us(self.histogram.value_at_percentile(99.0)),
            p999_us: us(self.histogram.value_at_percentile(99.9)),
            max_us: us(self.histogram.max()),
        }
    }
}
