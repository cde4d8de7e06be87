//! Cache key generation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub hash: String,
    pub method: Option<String>,
}

impl CacheKey {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into(), method: None }
    }
    pub fn with_method(mut self, method: impl Into<String>) -> Self { self.method = Some(method.into()); self }
    pub fn as_str(&self) -> &str { &self.hash }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.hash) }
}

impl From<&str> for CacheKey { fn from(s: &str) -> Self { Self::new(s) } }
impl From<String> for CacheKey { fn from(s: String) -> Self { Self::new(s) } }

/// Derives a stable key from `(method, params)`.
///
/// Object keys inside params are hashed in sorted order, so `{"a":1,"b":2}` and
/// `{"b":2,"a":1}` map to the same entry.
pub struct CacheKeyGenerator;

impl CacheKeyGenerator {
    pub fn new() -> Self { Self }

    pub fn generate(&self, method: &str, params: &[Value]) -> CacheKey {
        let mut parts: BTreeMap<&str, String> = BTreeMap::new();
        parts.insert("method", method.to_string());
        let canonical_params: Vec<Value> = params.iter().map(canonicalize).collect();
        parts.insert("params", serde_json::to_string(&canonical_params).unwrap_or_default());
        let canonical = serde_json::to_string(&parts).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hash: String = hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect();
        CacheKey::new(hash).with_method(method)
    }
}

impl Default for CacheKeyGenerator { fn default() -> Self { Self::new() } }

fn canonicalize(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            serde_json::to_value(sorted).unwrap_or(Value::Null)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
