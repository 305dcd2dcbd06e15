//! Circuit breaker pattern for API resilience.
//!
//! One breaker exists per logical operation name. A breaker stops calls to an
//! operation once it has failed `failure_threshold` times inside
//! `failure_window`, waits out `cooldown`, then lets a single trial call
//! through to decide whether to close again.
//!
//! ```text
//! Closed   → Open:     threshold reached inside the window
//! Open     → HalfOpen: cooldown elapsed (first caller becomes the trial)
//! HalfOpen → Closed:   trial answered
//! HalfOpen → Open:     trial failed, cooldown restarts
//! ```

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::failure::Classify;

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that open the circuit.
    pub failure_threshold: u32,
    /// Sliding window failures are counted in, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub failure_window: Duration,
    /// Time spent open before a trial call is allowed, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// States of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests allowed.
    Closed,
    /// Failing fast - requests immediately rejected.
    Open,
    /// One trial request in flight or about to be.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Why a call was not let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerRejection {
    /// State observed at rejection time.
    pub state: CircuitState,
    /// Remaining cooldown; zero while a half-open trial is pending.
    pub retry_after: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker for a single logical operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask to make a call.
    ///
    /// The returned permit must be settled with the call's outcome; dropping
    /// it unsettled releases a half-open trial slot without changing state.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, BreakerRejection> {
        let now = Instant::now();
        let mut inner = self.lock();

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed < self.config.cooldown {
                    drop(inner);
                    return Err(self.reject(CircuitState::Open, self.config.cooldown - elapsed));
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                tracing::info!(operation = %self.name, "circuit half-open, admitting trial call");
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    drop(inner);
                    return Err(self.reject(CircuitState::HalfOpen, Duration::ZERO));
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    fn reject(&self, state: CircuitState, retry_after: Duration) -> BreakerRejection {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        BreakerRejection { state, retry_after }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failures.clear(),
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.trial_in_flight = false;
                tracing::info!(operation = %self.name, "circuit closed after successful trial");
            }
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                let window = self.config.failure_window;
                while inner
                    .failures
                    .front()
                    .is_some_and(|t| now.saturating_duration_since(*t) > window)
                {
                    inner.failures.pop_front();
                }
                inner.failures.push_back(now);

                let failures = inner.failures.len();
                if failures >= self.config.failure_threshold.max(1) as usize {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    tracing::warn!(
                        operation = %self.name,
                        failures,
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                tracing::warn!(operation = %self.name, "trial call failed, circuit re-opened");
            }
            _ => {}
        }
    }

    fn on_release(&self, trial: bool) {
        if trial {
            let mut inner = self.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.trial_in_flight = false;
            }
        }
    }

    /// Current state, without applying any pending cooldown transition.
    pub fn current_state(&self) -> CircuitState {
        self.lock().state
    }

    /// Failures currently counted in the window.
    pub fn failure_count(&self) -> usize {
        self.lock().failures.len()
    }

    /// Calls rejected since the breaker was created.
    pub fn rejection_count(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }
}

/// Permission to make one call through a breaker.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this is the single half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }

    /// Settle the permit from a call result.
    ///
    /// Failures that indicate unavailability count against the circuit. Any
    /// other remote answer (a rejection, a malformed body) leaves the failure
    /// window untouched, except for a half-open trial where it proves the
    /// remote is reachable and closes the circuit. Errors that never reached
    /// the remote only release the permit.
    pub fn record<T, E: Classify>(mut self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.record_success(),
            Err(error) => match error.failure_kind() {
                Some(kind) if kind.indicates_unavailability() => self.record_failure(),
                Some(_) if self.trial => self.record_success(),
                Some(_) => self.settled = true,
                None => drop(self),
            },
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_release(self.trial);
        }
    }
}

/// Breakers keyed by operation name.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Get or create the breaker for an operation.
    pub fn get_or_create(&self, operation: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(operation) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(operation, self.default_config)))
            .clone()
    }

    /// The breaker for an operation, if one was ever created.
    pub fn get(&self, operation: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(operation)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// `(operation, state)` for every known breaker, sorted by operation.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().current_state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Whether an operation's circuit is closed. Unknown operations are healthy.
    pub fn is_healthy(&self, operation: &str) -> bool {
        self.breakers
            .get(operation)
            .map(|cb| cb.current_state() == CircuitState::Closed)
            .unwrap_or(true)
    }

    /// Close every breaker.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
