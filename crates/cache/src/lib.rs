//! Response cache for remote API calls.
//!
//! Responses are stored as serialized bytes under a [`CacheKey`] derived from
//! the operation name and its [`Arguments`]. [`TtlCache`] bounds memory with
//! LRU eviction across all shards and drops entries lazily once their TTL runs out;
//! [`NoopCache`] turns caching off without touching call sites.
//!
//! ```
//! use bytes::Bytes;
//! use cache::{Arguments, CacheKey, CacheStore, TtlCache};
//! use std::time::Duration;
//!
//! let cache = TtlCache::new(1024, 16, Duration::from_secs(60));
//! let key = CacheKey::new("list-hosts", &Arguments::new().with("folder", "/prod"));
//! cache.put(key.clone(), Bytes::from_static(b"[]"), cache.default_ttl());
//! assert!(cache.get(&key).is_some());
//! assert_eq!(cache.invalidate_prefix("list-hosts"), 1);
//! ```

mod key;
mod policy;
mod stats;
mod store;

pub use key::{Arguments, CacheKey, OPERATION_SEPARATOR};
pub use policy::CachePolicy;
pub use stats::CacheStats;
pub use store::{CacheEntry, CacheStore, NoopCache, TtlCache};
