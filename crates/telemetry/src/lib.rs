//! Call metrics for the apiguard middleware.
//!
//! [`MetricsCollector`] keeps counters and a latency histogram per operation
//! name and hands out [`MetricsSnapshot`] copies. It is owned by the gateway
//! and injected, never global; the `metrics` facade forwarding is the only
//! process-wide side effect.

mod class;
mod collector;
mod histogram;

pub use class::FailureClass;
pub use collector::{
    describe_metrics, MetricsCollector, MetricsSnapshot, OperationSnapshot, CACHE_HITS_TOTAL,
    CACHE_MISSES_TOTAL, CALLS_TOTAL, CALL_LATENCY_SECONDS, DEFAULT_MAX_OPERATIONS, FAILURES_TOTAL,
    RETRIES_TOTAL,
};
pub use histogram::{LatencyHistogram, LatencySummary};
