use serde::{Deserialize, Serialize};

/// One recorded round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Originator send time (`ts1` of the request).
    pub observed_at: u64,
    pub latency_ns: u64,
    pub send_size: u16,
    pub reply_size: u16,
}

/// Percentile value pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_ns: f64,
}

/// Distribution of every latency sample in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub total_samples: usize,
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    /// Population variance.
    pub variance_ns2: f64,
    pub std_dev_ns: f64,
    pub percentiles: Vec<PercentileValue>,
}

impl LatencySummary {
    /// Summarize `latencies`, or `None` when there are no samples.
    pub fn from_latencies(mut latencies: Vec<u64>, percentiles: &[f64]) -> Option<Self> {
        if latencies.is_empty() {
            return None;
        }
        latencies.sort_unstable();

        let n = latencies.len() as f64;
        let mean = latencies.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = latencies
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;

        let percentiles = percentiles
            .iter()
            .filter_map(|&p| {
                percentile(&latencies, p).map(|value_ns| PercentileValue {
                    percentile: p,
                    value_ns,
                })
            })
            .collect();

        Some(Self {
            total_samples: latencies.len(),
            min_ns: latencies[0],
            max_ns: latencies[latencies.len() - 1],
            mean_ns: mean,
            variance_ns2: variance,
            std_dev_ns: variance.sqrt(),
            percentiles,
        })
    }

    pub fn from_samples<'a>(samples: impl IntoIterator<Item = &'a Sample>, percentiles: &[f64]) -> Option<Self> {
        Self::from_latencies(samples.into_iter().map(|s| s.latency_ns).collect(), percentiles)
    }

    /// Value recorded for `p`, if it was requested.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|v| (v.percentile - p).abs() < 1e-9)
            .map(|v| v.value_ns)
    }
}

/// Message and byte rates over a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputMetrics {
    pub frames_per_second: f64,
    pub bytes_per_second: f64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub duration_ns: u64,
}

impl ThroughputMetrics {
    pub fn new(total_frames: u64, total_bytes: u64, duration_ns: u64) -> Self {
        let secs = duration_ns as f64 / 1_000_000_000.0;
        let rate = |count: u64| if secs > 0.0 { count as f64 / secs } else { 0.0 };
        Self {
            frames_per_second: rate(total_frames),
            bytes_per_second: rate(total_bytes),
            total_frames,
            total_bytes,
            duration_ns,
        }
    }
}

/// Percentile of an ascending slice.
///
/// With `i = n * p / 100`: a whole `i` averages the 1-indexed samples `i` and
/// `i + 1`; otherwise the 1-indexed sample `ceil(i)` is taken. Indices are
/// clamped to the slice, so `p = 0` is the minimum and `p = 100` the maximum.
pub fn percentile(sorted: &[u64], p: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let p = p.clamp(0.0, 100.0);
    let i = n as f64 * p / 100.0;
    let rounded = i.round();

    if (i - rounded).abs() < 1e-9 {
        let i = rounded as usize;
        if i == 0 {
            return Some(sorted[0] as f64);
        }
        if i >= n {
            return Some(sorted[n - 1] as f64);
        }
        Some((sorted[i - 1] as f64 + sorted[i] as f64) / 2.0)
    } else {
        let idx = (i.ceil() as usize).clamp(1, n);
        Some(sorted[idx - 1] as f64)
    }
}

/// Utility functions for metrics formatting
pub mod utils {
    /// Format latency value for human-readable output
    pub fn format_latency(latency_ns: f64) -> String {
        if latency_ns < 1_000.0 {
            format!("{:.0}ns", latency_ns)
        } else if latency_ns < 1_000_000.0 {
            format!("{:.2}μs", latency_ns / 1_000.0)
        } else if latency_ns < 1_000_000_000.0 {
            format!("{:.2}ms", latency_ns / 1_000_000.0)
        } else {
            format!("{:.2}s", latency_ns / 1_000_000_000.0)
        }
    }
}
