//! # Batch Transports
//!
//! A [`BatchTransport`] carries one [`RequestBatch`] to a dispatcher and brings the
//! [`ResponseBatch`] back. The aggregator only ever talks to this trait.
//!
//! | Transport | Description |
//! |-----------|-------------|
//! | [`InProcessTransport`] | Direct call into a shared [`Dispatcher`] |
//! | [`HttpTransport`] | JSON over HTTP POST via `reqwest` |

mod http;

pub use http::HttpTransport;

use crate::dispatcher::Dispatcher;
use crate::protocol::{RequestBatch, ResponseBatch};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Dispatcher unavailable at {endpoint}: {reason}")]
    Unavailable { endpoint: String, reason: String },
}

#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn send(&self, batch: RequestBatch) -> Result<ResponseBatch>;

    fn name(&self) -> &'static str;
}

/// Calls a dispatcher living in the same process.
///
/// With `wire_round_trip` enabled the batch is serialized to JSON bytes and back,
/// exercising exactly the path a cross-process carrier would take.
pub struct InProcessTransport {
    dispatcher: Arc<Dispatcher>,
    wire_round_trip: bool,
}

impl InProcessTransport {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            wire_round_trip: false,
        }
    }

    pub fn with_wire_round_trip(mut self, enabled: bool) -> Self {
        self.wire_round_trip = enabled;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

#[async_trait]
impl BatchTransport for InProcessTransport {
    async fn send(&self, batch: RequestBatch) -> Result<ResponseBatch> {
        if !self.wire_round_trip {
            return self.dispatcher.process_batch(batch).await;
        }
        let payload = serde_json::to_vec(&batch)?;
        let out = self.dispatcher.process_json(&payload).await?;
        Ok(serde_json::from_slice(&out)?)
    }

    fn name(&self) -> &'static str {
        "in_process"
    }
}
