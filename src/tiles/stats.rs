//! Load-time telemetry for the request dispatcher
//!
//! Counters only grow until [`StatsAggregator::reset`]. Load times go into a
//! rolling window; percentiles are nearest-rank over a sorted copy of that window,
//! recomputed on every query.

use serde::Serialize;
use std::collections::VecDeque;

/// Default size of the rolling load-time window
pub const DEFAULT_MAX_SAMPLES: usize = 1000;

/// Point-in-time view of the aggregated statistics. Times are in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub average_load_time: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Request counters plus a bounded window of load-time samples
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    total: u64,
    success: u64,
    failed: u64,
    cancelled: u64,
    load_times: VecDeque<f64>,
    max_samples: usize,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SAMPLES)
    }
}

impl StatsAggregator {
    pub fn new(max_samples: usize) -> Self {
        Self {
            total: 0,
            success: 0,
            failed: 0,
            cancelled: 0,
            load_times: VecDeque::with_capacity(max_samples.min(DEFAULT_MAX_SAMPLES)),
            max_samples,
        }
    }

    /// Record a load time in milliseconds, dropping the oldest sample past the bound
    pub fn record_load_time(&mut self, ms: f64) {
        self.load_times.push_back(ms);
        while self.load_times.len() > self.max_samples {
            self.load_times.pop_front();
        }
    }

    pub fn record_request_start(&mut self) {
        self.total += 1;
    }

    pub fn record_success(&mut self) {
        self.success += 1;
    }

    pub fn record_failed(&mut self) {
        self.failed += 1;
    }

    pub fn record_cancelled(&mut self) {
        self.cancelled += 1;
    }

    pub fn sample_count(&self) -> usize {
        self.load_times.len()
    }

    pub fn stats(&self) -> LoadStats {
        let mut sorted: Vec<f64> = self.load_times.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let average_load_time = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };

        LoadStats {
            total: self.total,
            success: self.success,
            failed: self.failed,
            cancelled: self.cancelled,
            average_load_time,
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        }
    }

    /// Clear counters and samples
    pub fn reset(&mut self) {
        self.total = 0;
        self.success = 0;
        self.failed = 0;
        self.cancelled = 0;
        self.load_times.clear();
    }
}

/// Nearest-rank percentile of an ascending slice: the value at
/// `ceil(p/100 * n) - 1`, clamped to the slice. Empty input yields 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    // p * n / 100 is exact for integral p and n, unlike (p / 100) * n
    let rank = (p * n as f64 / 100.0).ceil() as i64;
    let index = (rank - 1).clamp(0, n as i64 - 1) as usize;
    sorted[index]
}
