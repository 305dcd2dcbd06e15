//! Per-call cache behaviour.

use std::time::Duration;

/// How a single call interacts with the cache.
///
/// A `ttl` of `None` means the cache's configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Never read or write the cache.
    #[default]
    NoCache,
    /// Serve a fresh entry when present; store the result on a miss.
    UseCache { ttl: Option<Duration> },
    /// Always call the remote, then overwrite the cached entry.
    BypassAndRefresh { ttl: Option<Duration> },
}

impl CachePolicy {
    /// `UseCache` with the default TTL.
    pub fn cached() -> Self {
        CachePolicy::UseCache { ttl: None }
    }

    pub fn cached_for(ttl: Duration) -> Self {
        CachePolicy::UseCache { ttl: Some(ttl) }
    }

    /// `BypassAndRefresh` with the default TTL.
    pub fn refresh() -> Self {
        CachePolicy::BypassAndRefresh { ttl: None }
    }

    pub fn reads_cache(&self) -> bool {
        matches!(self, CachePolicy::UseCache { .. })
    }

    pub fn writes_cache(&self) -> bool {
        !matches!(self, CachePolicy::NoCache)
    }

    /// TTL to store with, falling back to `default`.
    pub fn ttl_or(&self, default: Duration) -> Duration {
        match self {
            CachePolicy::NoCache => Duration::ZERO,
            CachePolicy::UseCache { ttl } | CachePolicy::BypassAndRefresh { ttl } => {
                ttl.unwrap_or(default)
            }
        }
    }
}
