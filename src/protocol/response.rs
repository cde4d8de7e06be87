//! Response side of the wire contract.

use super::error::{ErrorKind, WireError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

pub(crate) fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    pub from_batch: bool,
    /// Milliseconds spent inside the handler, exclusive of queueing.
    pub execution_time: f64,
}

/// Outcome of one request entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEntry {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    pub metadata: EntryMetadata,
}

impl ResponseEntry {
    pub fn ok(id: impl Into<String>, data: Value, execution_time: Duration) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
            metadata: EntryMetadata {
                from_batch: true,
                execution_time: duration_ms(execution_time),
            },
        }
    }

    pub fn failed(id: impl Into<String>, error: WireError, execution_time: Duration) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error),
            metadata: EntryMetadata {
                from_batch: true,
                execution_time: duration_ms(execution_time),
            },
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Converts the entry into the caller-facing outcome.
    ///
    /// A `success` entry without `data` resolves to `Value::Null`; a failed entry
    /// without an error payload is reported as `HANDLER_ERROR`.
    pub fn into_result(self) -> std::result::Result<Value, WireError> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| {
                WireError::handler_error("request failed without an error payload")
            }))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    pub processed: usize,
    pub errors: usize,
    /// Wall-clock milliseconds for the whole batch.
    pub total_time: f64,
}

/// Response to one `RequestBatch`, one entry per request id in no particular order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBatch {
    pub batch_id: String,
    pub responses: Vec<ResponseEntry>,
    pub metadata: BatchMetadata,
}

impl ResponseBatch {
    pub fn new(batch_id: impl Into<String>, responses: Vec<ResponseEntry>, total_time: Duration) -> Self {
        let errors = responses.iter().filter(|r| !r.success).count();
        Self {
            batch_id: batch_id.into(),
            metadata: BatchMetadata {
                processed: responses.len(),
                errors,
                total_time: duration_ms(total_time),
            },
            responses,
        }
    }

    pub fn get(&self, id: &str) -> Option<&ResponseEntry> {
        self.responses.iter().find(|r| r.id == id)
    }

    pub fn success_count(&self) -> usize {
        self.responses.iter().filter(|r| r.success).count()
    }

    pub fn failure_count(&self) -> usize {
        self.responses.len() - self.success_count()
    }

    /// Consumes the batch into an id-addressable map.
    pub fn into_map(self) -> HashMap<String, ResponseEntry> {
        self.responses
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect()
    }
}
