//! Resilience and performance middleware between API clients and a remote
//! monitoring platform.
//!
//! Every logical call made through a [`Gateway`] follows the same path:
//!
//! ```text
//! cache ──hit──────────────────────────────────────────────▶ value
//!   │miss
//!   ▼
//! circuit breaker ──open──▶ CircuitOpen
//!   │closed / half-open trial
//!   ▼
//! retry (backoff + jitter, per-attempt timeout, call deadline)
//!   │
//!   ▼
//! Transport ──▶ value ──▶ cache populated, metrics recorded
//! ```
//!
//! [`PageStream`] and [`Gateway::submit_batch`] are built on the same call
//! path, sequentially and concurrently.
//!
//! ```no_run
//! use apiguard::{Arguments, CallOptions, Gateway, GatewayConfig, SimulatedTransport};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = Gateway::new(SimulatedTransport::new(), GatewayConfig::load()?)?;
//! let hosts = gateway
//!     .invoke("list-hosts", &Arguments::new().with("folder", "/prod"), &CallOptions::cached())
//!     .await?;
//! println!("{hosts}");
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
mod error;
mod gateway;
pub mod simulated;
pub mod stream;
mod transport;

pub use batch::{BatchItem, BatchOptions, BatchReport, BatchResult};
pub use config::{BatchConfig, CacheConfig, ConfigError, GatewayConfig, MetricsConfig, StreamConfig};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{CallOptions, Gateway, GatewayBuilder};
pub use simulated::SimulatedTransport;
pub use stream::{PageLayout, PageStream, StreamCursor};
pub use transport::Transport;

pub use cache::{Arguments, CacheKey, CachePolicy, CacheStats, CacheStore, NoopCache, TtlCache};
pub use resilience::{
    CircuitBreakerConfig, CircuitState, FailureKind, RemoteError, RetryPolicy,
};
pub use telemetry::{FailureClass, LatencySummary, MetricsCollector, MetricsSnapshot, OperationSnapshot};
pub use tokio_util::sync::CancellationToken;
