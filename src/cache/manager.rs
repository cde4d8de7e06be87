//! Cache manager.

use super::backend::CacheBackend;
use super::key::CacheKey;
use crate::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub enabled: bool,
    pub max_entry_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { default_ttl: Duration::from_secs(5), enabled: true, max_entry_size: 1024 * 1024 }
    }
}

impl CacheConfig {
    pub fn new() -> Self { Self::default() }
    pub fn with_ttl(mut self, ttl: Duration) -> Self { self.default_ttl = ttl; self }
    pub fn with_enabled(mut self, enabled: bool) -> Self { self.enabled = enabled; self }
    pub fn with_max_entry_size(mut self, bytes: usize) -> Self { self.max_entry_size = bytes; self }
}

/// Typed front of a [`CacheBackend`] with a TTL and an on/off switch.
pub struct CacheManager { config: CacheConfig, backend: Box<dyn CacheBackend> }

impl CacheManager {
    pub fn new(config: CacheConfig, backend: Box<dyn CacheBackend>) -> Self { Self { config, backend } }

    pub fn is_enabled(&self) -> bool { self.config.enabled }

    /// Undecodable entries count as misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
        if !self.config.enabled { return Ok(None); }
        match self.backend.get(key).await? {
            Some(data) => Ok(serde_json::from_slice(&data).ok()),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<()> { self.set_with_ttl(key, value, self.config.default_ttl).await }

    pub async fn set_with_ttl<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) -> Result<()> {
        if !self.config.enabled { return Ok(()); }
        let data = serde_json::to_vec(value)?;
        if data.len() > self.config.max_entry_size {
            trace!(key = %key, size = data.len(), "entry too large to cache");
            return Ok(());
        }
        self.backend.set(key, &data, ttl).await
    }

    pub async fn clear(&self) -> Result<()> { self.backend.clear().await }

    pub fn backend_name(&self) -> &'static str { self.backend.name() }
}
