//! Lock-free latency histogram.
//!
//! Values are bucketed in microseconds: exact below 16µs, then eight
//! sub-buckets per power of two, which keeps every reported percentile
//! within 12.5% of the true value.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LINEAR_BUCKETS: usize = 16;
const SUB_BUCKET_BITS: u32 = 3;
const SUB_BUCKETS: usize = 1 << SUB_BUCKET_BITS;
const BUCKETS: usize = LINEAR_BUCKETS + (64 - 4) * SUB_BUCKETS;

fn bucket_index(micros: u64) -> usize {
    if micros < LINEAR_BUCKETS as u64 {
        return micros as usize;
    }
    let exponent = 63 - micros.leading_zeros();
    let sub = (micros >> (exponent - SUB_BUCKET_BITS)) as usize & (SUB_BUCKETS - 1);
    LINEAR_BUCKETS + (exponent as usize - 4) * SUB_BUCKETS + sub
}

fn bucket_upper_bound(index: usize) -> u64 {
    if index < LINEAR_BUCKETS {
        return index as u64;
    }
    let exponent = ((index - LINEAR_BUCKETS) / SUB_BUCKETS + 4) as u32;
    let sub = ((index - LINEAR_BUCKETS) % SUB_BUCKETS) as u64;
    let shift = exponent - SUB_BUCKET_BITS;
    ((SUB_BUCKETS as u64 + sub) << shift) + ((1u64 << shift) - 1)
}

/// Latency percentiles in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Concurrent histogram of call latencies.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: Box<[AtomicU64]>,
    count: AtomicU64,
    sum_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
            max_micros: AtomicU64::new(0),
        }
    }

    pub fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.buckets[bucket_index(micros)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Latency at quantile `q` (0.0..=1.0).
    pub fn quantile(&self, q: f64) -> Duration {
        Duration::from_micros(self.quantile_micros(q))
    }

    fn quantile_micros(&self, q: f64) -> u64 {
        let count = self.count();
        let max = self.max_micros.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        let rank = ((q.clamp(0.0, 1.0) * count as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= rank {
                return bucket_upper_bound(index).min(max);
            }
        }
        // Concurrent writers can leave the buckets behind `count`.
        max
    }

    pub fn summary(&self) -> LatencySummary {
        let count = self.count();
        if count == 0 {
            return LatencySummary::default();
        }
        let to_ms = |micros: u64| micros as f64 / 1_000.0;
        LatencySummary {
            count,
            mean_ms: to_ms(self.sum_micros.load(Ordering::Relaxed)) / count as f64,
            p50_ms: to_ms(self.quantile_micros(0.50)),
            p95_ms: to_ms(self.quantile_micros(0.95)),
            p99_ms: to_ms(self.quantile_micros(0.99)),
            max_ms: to_ms(self.max_micros.load(Ordering::Relaxed)),
        }
    }
}
