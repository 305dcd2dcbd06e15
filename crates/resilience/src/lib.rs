//! Fault tolerance primitives for remote API calls.
//!
//! These wrap a single logical operation against the monitoring API:
//!
//! - [`failure`]: the classified failure contract every transport returns
//! - [`retry`]: bounded retries with exponential backoff and jitter
//! - [`circuit_breaker`]: per-operation breakers that fail fast while the
//!   remote is unhealthy
//!
//! The retry executor knows nothing about breakers. Callers compose them as
//! breaker → retry → transport, so one logical call produces exactly one
//! breaker outcome regardless of how many attempts it took.

mod circuit_breaker;
mod failure;
mod retry;
pub mod serde_millis;

pub use circuit_breaker::{
    BreakerPermit, BreakerRejection, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitState,
};
pub use failure::{AttemptTimeout, Classify, FailureKind, RemoteError};
pub use retry::{execute_with_retry, RetryPolicy, RetryResult};
