//! In-process stand-in for the monitoring API.
//!
//! Used by the demo binary and the test suites. Behaviour is scripted per
//! operation: fixed responses, paged collections, one-shot or permanent
//! failures, and artificial latency. Every call is counted, and the highest
//! number of concurrent calls is tracked.

use async_trait::async_trait;
use cache::Arguments;
use resilience::RemoteError;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::stream::PageLayout;
use crate::transport::Transport;

/// Page size used when a collection request carries no limit.
const DEFAULT_PAGE_LIMIT: usize = 100;

#[derive(Debug)]
struct FailureRule {
    operation: String,
    argument: Option<(String, Value)>,
    remaining: Option<u32>,
    error: RemoteError,
}

impl FailureRule {
    fn matches(&self, operation: &str, arguments: &Arguments) -> bool {
        self.operation == operation
            && self
                .argument
                .as_ref()
                .is_none_or(|(name, value)| arguments.get(name) == Some(value))
    }
}

#[derive(Debug, Default)]
struct SimState {
    responses: HashMap<String, Value>,
    collections: HashMap<String, Arc<Vec<Value>>>,
    rules: Vec<FailureRule>,
    latency: HashMap<String, Duration>,
    default_latency: Duration,
    calls: HashMap<String, u64>,
}

/// Scripted [`Transport`] with call accounting.
///
/// Clones share state, so a test can hand one clone to the gateway and keep
/// another to script failures and read counters.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    layout: Arc<PageLayout>,
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a non-default page layout for collections.
    pub fn with_layout(mut self, layout: PageLayout) -> Self {
        self.layout = Arc::new(layout);
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fixed response for an operation. Operations without one echo their
    /// arguments back.
    pub fn set_response(&self, operation: &str, response: Value) {
        self.state().responses.insert(operation.to_owned(), response);
    }

    /// Serve `items` page by page for an operation.
    pub fn set_collection(&self, operation: &str, items: Vec<Value>) {
        self.state()
            .collections
            .insert(operation.to_owned(), Arc::new(items));
    }

    /// Fail the next `times` calls of an operation.
    pub fn fail_next(&self, operation: &str, times: u32, error: RemoteError) {
        self.state().rules.push(FailureRule {
            operation: operation.to_owned(),
            argument: None,
            remaining: Some(times),
            error,
        });
    }

    /// Fail every call of an operation until cleared.
    pub fn fail_always(&self, operation: &str, error: RemoteError) {
        self.state().rules.push(FailureRule {
            operation: operation.to_owned(),
            argument: None,
            remaining: None,
            error,
        });
    }

    /// Fail every call of an operation whose argument `name` equals `value`.
    pub fn fail_when(&self, operation: &str, name: &str, value: impl Into<Value>, error: RemoteError) {
        self.state().rules.push(FailureRule {
            operation: operation.to_owned(),
            argument: Some((name.to_owned(), value.into())),
            remaining: None,
            error,
        });
    }

    /// Drop every failure rule for an operation.
    pub fn clear_failures(&self, operation: &str) {
        self.state().rules.retain(|rule| rule.operation != operation);
    }

    /// Delay applied to every call without an operation-specific latency.
    pub fn set_default_latency(&self, latency: Duration) {
        self.state().default_latency = latency;
    }

    pub fn set_latency(&self, operation: &str, latency: Duration) {
        self.state().latency.insert(operation.to_owned(), latency);
    }

    /// Calls received for an operation, failed ones included.
    pub fn calls(&self, operation: &str) -> u64 {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.state().calls.values().sum()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.state().calls.clear();
        self.max_in_flight.store(0, Ordering::SeqCst);
    }

    fn next_failure(&self, operation: &str, arguments: &Arguments) -> Option<RemoteError> {
        let mut state = self.state();
        let index = state
            .rules
            .iter()
            .position(|rule| rule.remaining != Some(0) && rule.matches(operation, arguments))?;
        let rule = &mut state.rules[index];
        let error = rule.error.clone();
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                state.rules.remove(index);
            }
        }
        Some(error)
    }

    fn page(&self, items: &[Value], arguments: &Arguments) -> Result<Value, RemoteError> {
        let layout = &self.layout;
        let limit = match arguments.get(&layout.limit_arg) {
            None => DEFAULT_PAGE_LIMIT,
            Some(value) => value
                .as_u64()
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .ok_or_else(|| RemoteError::rejected(format!("invalid {}", layout.limit_arg)))?,
        };
        let offset = match arguments.get(&layout.cursor_arg) {
            None => 0,
            Some(value) => value
                .as_str()
                .and_then(|token| token.parse::<usize>().ok())
                .filter(|offset| *offset <= items.len())
                .ok_or_else(|| RemoteError::rejected(format!("invalid {}", layout.cursor_arg)))?,
        };

        let end = offset.saturating_add(limit).min(items.len());
        let mut page = Map::new();
        page.insert(layout.items_field.clone(), Value::Array(items[offset..end].to_vec()));
        if end < items.len() {
            page.insert(layout.cursor_field.clone(), Value::String(end.to_string()));
        }
        Ok(Value::Object(page))
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn call(&self, operation: &str, arguments: &Arguments) -> Result<Value, RemoteError> {
        let latency = {
            let mut state = self.state();
            *state.calls.entry(operation.to_owned()).or_default() += 1;
            state
                .latency
                .get(operation)
                .copied()
                .unwrap_or(state.default_latency)
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight {
            counter: &self.in_flight,
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.next_failure(operation, arguments) {
            return Err(error);
        }

        let (collection, response) = {
            let state = self.state();
            (
                state.collections.get(operation).cloned(),
                state.responses.get(operation).cloned(),
            )
        };
        if let Some(items) = collection {
            return self.page(&items, arguments);
        }
        Ok(response.unwrap_or_else(|| {
            json!({
                "operation": operation,
                "arguments": arguments.to_value(),
            })
        }))
    }
}
