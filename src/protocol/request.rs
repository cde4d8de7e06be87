//! Request side of the wire contract.

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch, saturating to zero on clock skew.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Scheduling hint attached to a request or a batch policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// A single logical call inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEntry {
    /// Caller-assigned, unique within one batch; the demux key.
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Per-request deadline override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl RequestEntry {
    pub fn new(id: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params: Vec::new(),
            priority: None,
            timeout: None,
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }
}

/// One physical submission: many entries, one round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBatch {
    pub batch_id: String,
    #[serde(default)]
    pub timestamp: u64,
    pub requests: Vec<RequestEntry>,
}

impl RequestBatch {
    pub fn new(batch_id: impl Into<String>, requests: Vec<RequestEntry>) -> Self {
        Self {
            batch_id: batch_id.into(),
            timestamp: now_millis(),
            requests,
        }
    }

    /// Creates a batch with a fresh random batch id.
    pub fn with_generated_id(requests: Vec<RequestEntry>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), requests)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Checks the input contract: a non-empty batch id and ids unique within the batch.
    pub fn validate(&self) -> Result<()> {
        if self.batch_id.trim().is_empty() {
            return Err(Error::malformed(
                "batch id is missing",
                ErrorContext::new().with_field_path("batchId"),
            ));
        }
        let mut seen = HashSet::with_capacity(self.requests.len());
        for (i, req) in self.requests.iter().enumerate() {
            if !seen.insert(req.id.as_str()) {
                return Err(Error::malformed(
                    format!("duplicate request id '{}'", req.id),
                    ErrorContext::new().with_field_path(format!("requests[{}].id", i)),
                ));
            }
        }
        Ok(())
    }

    /// Decodes a serialized batch, mapping any shape violation to `MalformedBatch`.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let batch: RequestBatch = serde_json::from_slice(payload).map_err(|e| {
            Error::malformed(
                "payload is not a valid request batch",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("wire_decoder"),
            )
        })?;
        batch.validate()?;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let batch = RequestBatch::new(
            "b-1",
            vec![RequestEntry::new("r-1", "get_metrics")
                .with_params(vec![json!(1)])
                .with_timeout(Duration::from_millis(250))],
        );
        let v = serde_json::to_value(&batch).unwrap();
        assert_eq!(v["batchId"], "b-1");
        assert_eq!(v["requests"][0]["timeout"], 250);
        assert!(v["requests"][0].get("priority").is_none());
    }

    #[test]
    fn test_missing_batch_id_is_malformed() {
        let err = RequestBatch::from_slice(br#"{"requests": []}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedBatch { .. }));
    }

    #[test]
    fn test_missing_requests_is_malformed() {
        let err = RequestBatch::from_slice(br#"{"batchId": "x"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedBatch { .. }));
    }

    #[test]
    fn test_duplicate_ids_are_malformed() {
        let batch = RequestBatch::new(
            "b",
            vec![RequestEntry::new("a", "m"), RequestEntry::new("a", "n")],
        );
        let err = batch.validate().unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.clone()),
            Some("requests[1].id".to_string())
        );
    }

    #[test]
    fn test_priority_defaults_to_medium() {
        assert_eq!(Priority::default(), Priority::Medium);
        let p: Priority = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(p, Priority::High);
    }
}
