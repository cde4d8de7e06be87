use super::{BatchTransport, TransportError};
use crate::protocol::{RequestBatch, ResponseBatch};
use crate::Result;
use async_trait::async_trait;
use std::env;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Posts the JSON batch to a dispatcher endpoint and decodes the JSON response.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
    bearer_token: Option<String>,
}

impl HttpTransport {
    /// Builds a transport for `endpoint` (e.g. `http://127.0.0.1:3001/api/batch`).
    ///
    /// Env overrides:
    /// - `IPC_BATCH_HTTP_TIMEOUT_SECS` (default 30)
    /// - `IPC_BATCH_HTTP_POOL_MAX_IDLE_PER_HOST` (default 32)
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| TransportError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(TransportError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: format!("unsupported scheme '{}'", endpoint.scheme()),
            }
            .into());
        }

        let timeout_secs = env::var("IPC_BATCH_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(
                env::var("IPC_BATCH_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(32),
            )
            .build()
            .map_err(TransportError::Http)?;

        Ok(Self {
            client,
            endpoint,
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl BatchTransport for HttpTransport {
    async fn send(&self, batch: RequestBatch) -> Result<ResponseBatch> {
        debug!(endpoint = %self.endpoint, batch_id = %batch.batch_id, size = batch.len(), "posting batch");
        let mut req = self
            .client
            .post(self.endpoint.clone())
            .header("x-batch-id", batch.batch_id.as_str())
            .json(&batch);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_connect() {
                TransportError::Unavailable {
                    endpoint: self.endpoint.to_string(),
                    reason: e.to_string(),
                }
            } else {
                TransportError::Http(e)
            }
        })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let batch: ResponseBatch = resp.json().await.map_err(TransportError::Http)?;
        Ok(batch)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
