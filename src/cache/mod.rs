//! # Response Cache
//!
//! Short-lived cache for results of `cacheable` methods, consulted by the
//! aggregator before a request is queued.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheManager`] | Typed get/set with TTL and an enable switch |
//! | [`CacheConfig`] | TTL, size limit, on/off |
//! | [`CacheBackend`] | Trait for implementing custom cache backends |
//! | [`MemoryCache`] | In-memory LRU cache with per-entry TTL |
//! | [`NullCache`] | No-op cache for disabling caching |
//! | [`CacheKey`] | SHA-256 key over `(method, params)` |

mod backend;
mod key;
mod manager;

pub use backend::{CacheBackend, MemoryCache, NullCache};
pub use key::{CacheKey, CacheKeyGenerator};
pub use manager::{CacheConfig, CacheManager};
