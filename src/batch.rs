//! Concurrent execution of many independent calls.
//!
//! Items run through the same cache, breaker and retry path as single calls,
//! at most `concurrency` at a time. One item's failure never fails another.
//! With a fail-fast threshold, items that have not started once too many
//! items failed are reported as `BatchAborted` instead of being run.

use cache::Arguments;
use futures::StreamExt;
use futures::stream;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BatchConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{CallOptions, Gateway};

/// One unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    /// Caller-chosen identifier, echoed in the result.
    pub id: String,
    pub operation: String,
    pub arguments: Arguments,
}

impl BatchItem {
    pub fn new(id: impl Into<String>, operation: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            id: id.into(),
            operation: operation.into(),
            arguments,
        }
    }
}

/// Outcome of one item.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Position of the item in the submitted list.
    pub index: usize,
    pub item: BatchItem,
    pub result: GatewayResult<Value>,
    /// Remote attempts made; zero for cache hits and items that never ran.
    pub attempts: u32,
    pub elapsed: Duration,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// How a batch runs.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Maximum items in flight, at least one.
    pub concurrency: usize,
    /// Fraction of all submitted items that, once failed, aborts unstarted ones.
    pub fail_fast_threshold: Option<f64>,
    /// Sort results by submission index instead of completion order.
    pub preserve_order: bool,
    /// Applied to every item.
    pub call_options: CallOptions,
    pub cancel: Option<CancellationToken>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from_config(&BatchConfig::default())
    }
}

impl BatchOptions {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            fail_fast_threshold: config.fail_fast_threshold,
            preserve_order: config.preserve_order,
            call_options: CallOptions::default(),
            cancel: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_fail_fast(mut self, threshold: f64) -> Self {
        self.fail_fast_threshold = Some(threshold);
        self
    }

    pub fn with_preserve_order(mut self, preserve: bool) -> Self {
        self.preserve_order = preserve;
        self
    }

    pub fn with_call_options(mut self, options: CallOptions) -> Self {
        self.call_options = options;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Failed items that trigger the abort for a batch of `total` items.
    fn abort_after(&self, total: usize) -> Option<usize> {
        let threshold = self.fail_fast_threshold?;
        let count = (threshold.clamp(0.0, 1.0) * total as f64).ceil() as usize;
        Some(count.max(1))
    }
}

/// Aggregate of a finished batch.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub succeeded: usize,
    /// Items that ran and failed.
    pub failed: usize,
    /// Items never started because the batch was aborted.
    pub skipped: usize,
    /// Items never started because the caller cancelled.
    pub cancelled: usize,
    /// Whether the fail-fast threshold was reached.
    pub aborted: bool,
    pub elapsed: Duration,
    /// Exactly one result per submitted item.
    pub results: Vec<BatchResult>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn successes(&self) -> impl Iterator<Item = &BatchResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

pub(crate) async fn run(gateway: &Gateway, items: Vec<BatchItem>, options: BatchOptions) -> BatchReport {
    let total = items.len();
    let started = Instant::now();
    let abort_after = options.abort_after(total);

    let aborted = AtomicBool::new(false);
    let failed = AtomicUsize::new(0);
    let aborted_ref = &aborted;
    let failed_ref = &failed;
    let call_options = &options.call_options;
    let cancel = options.cancel.as_ref();

    let mut results: Vec<BatchResult> = stream::iter(items.into_iter().enumerate())
        .map(move |(index, item)| async move {
            let start = Instant::now();
            let skip = if cancel.is_some_and(|token| token.is_cancelled()) {
                Some(GatewayError::Cancelled)
            } else if aborted_ref.load(Ordering::Acquire) {
                Some(GatewayError::BatchAborted)
            } else {
                None
            };

            let (result, attempts) = match skip {
                Some(error) => (Err(error), 0),
                None => {
                    let report = gateway
                        .call(&item.operation, &item.arguments, call_options)
                        .await;
                    if report.result.is_err() {
                        let failures = failed_ref.fetch_add(1, Ordering::AcqRel) + 1;
                        if abort_after.is_some_and(|limit| failures >= limit)
                            && !aborted_ref.swap(true, Ordering::AcqRel)
                        {
                            tracing::warn!(failures, total, "batch fail-fast threshold reached, aborting");
                        }
                    }
                    (report.result, report.attempts)
                }
            };

            BatchResult {
                index,
                item,
                result,
                attempts,
                elapsed: start.elapsed(),
            }
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    if options.preserve_order {
        results.sort_by_key(|r| r.index);
    }

    let mut report = BatchReport {
        succeeded: 0,
        failed: 0,
        skipped: 0,
        cancelled: 0,
        aborted: aborted.load(Ordering::Acquire),
        elapsed: started.elapsed(),
        results,
    };
    for result in &report.results {
        match &result.result {
            Ok(_) => report.succeeded += 1,
            Err(GatewayError::BatchAborted) => report.skipped += 1,
            Err(GatewayError::Cancelled) => report.cancelled += 1,
            Err(_) => report.failed += 1,
        }
    }

    tracing::info!(
        total,
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        cancelled = report.cancelled,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "batch finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_count_rounds_up_and_is_at_least_one() {
        let options = BatchOptions::new(4).with_fail_fast(0.25);
        assert_eq!(options.abort_after(10), Some(3));
        assert_eq!(options.abort_after(0), Some(1));
        assert_eq!(BatchOptions::new(4).abort_after(10), None);
        assert_eq!(BatchOptions::new(4).with_fail_fast(1.0).abort_after(7), Some(7));
    }

    #[test]
    fn defaults_follow_batch_config() {
        let options = BatchOptions::default();
        assert_eq!(options.concurrency, 8);
        assert!(options.fail_fast_threshold.is_none());
        assert!(!options.preserve_order);
    }
}
