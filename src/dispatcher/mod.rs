//! # Batch Dispatcher
//!
//! Server side of the batching layer. Owns the method registry and executes a
//! [`RequestBatch`] concurrently, isolating every entry's success, failure and
//! latency from its siblings.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Dispatcher`] | Executes batches and tracks [`BatchStats`] |
//! | [`DispatcherConfig`] | Admission limit and system default timeout |
//! | [`Handler`] | Capability invoked by method name |
//! | [`HandlerRegistry`] | Copy-on-write method table |
//!
//! ## Failure Semantics
//!
//! Per-entry failures (`HANDLER_NOT_FOUND`, `TIMEOUT`, `HANDLER_ERROR`) are values
//! in the response. Only a malformed batch makes [`Dispatcher::process_batch`]
//! itself return an error.
//!
//! ## Example
//!
//! ```rust
//! use ipc_batch::dispatcher::{handler_fn, Dispatcher};
//! use ipc_batch::protocol::{RequestBatch, RequestEntry};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> ipc_batch::Result<()> {
//! let dispatcher = Dispatcher::new();
//! dispatcher.register_fn("echo", |params| async move { Ok(json!(params)) });
//!
//! let batch = RequestBatch::new("b-1", vec![RequestEntry::new("1", "echo")]);
//! let response = dispatcher.process_batch(batch).await?;
//! assert_eq!(response.batch_id, "b-1");
//! # Ok(())
//! # }
//! ```

mod executor;
mod registry;

pub use executor::InflightSnapshot;
pub use registry::{handler_fn, FnHandler, Handler, HandlerRegistration, HandlerRegistry};

use crate::protocol::{RequestBatch, RequestEntry, ResponseBatch, ResponseEntry, WireError};
use crate::stats::{BatchStats, StatsRecorder};
use crate::Result;
use executor::{EntryExecutor, EntryOutcome};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum handler invocations holding a slot at once, across all batches.
    pub max_concurrent_requests: usize,
    /// Deadline used when neither the request nor the registration sets one.
    pub default_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            default_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden from the environment:
    /// - `IPC_BATCH_MAX_CONCURRENCY`
    /// - `IPC_BATCH_DEFAULT_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = std::env::var("IPC_BATCH_MAX_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|v| *v > 0)
        {
            cfg.max_concurrent_requests = n;
        }
        if let Some(ms) = std::env::var("IPC_BATCH_DEFAULT_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            cfg.default_timeout = Duration::from_millis(ms);
        }
        cfg
    }

    pub fn with_max_concurrent_requests(mut self, n: usize) -> Self {
        self.max_concurrent_requests = n.max(1);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Entries that run as one invocation: a single entry, or identical cacheable entries.
struct Group {
    ids: Vec<String>,
    request: RequestEntry,
    registration: Option<Arc<HandlerRegistration>>,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    registry: HandlerRegistry,
    executor: EntryExecutor,
    stats: StatsRecorder,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        let executor = EntryExecutor::new(config.max_concurrent_requests, config.default_timeout);
        Self {
            config,
            registry: HandlerRegistry::new(),
            executor,
            stats: StatsRecorder::new(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Installs or replaces the handler for `method`.
    pub fn register_handler(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn Handler>,
        cacheable: bool,
        timeout: Option<Duration>,
    ) {
        let method = method.into();
        debug!(method = %method, cacheable, "registering handler");
        self.registry.register(HandlerRegistration {
            method,
            handler,
            cacheable,
            default_timeout: timeout,
        });
    }

    /// Registers an async closure with default options.
    pub fn register_fn<F, Fut>(&self, method: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_handler(method, handler_fn(f), false, None);
    }

    pub fn unregister_handler(&self, method: &str) -> bool {
        self.registry.unregister(method).is_some()
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.registry.has(method)
    }

    pub fn inflight(&self) -> InflightSnapshot {
        self.executor.inflight()
    }

    /// Executes every entry of `batch` and returns one response per request id.
    pub async fn process_batch(&self, batch: RequestBatch) -> Result<ResponseBatch> {
        batch.validate()?;
        let started = Instant::now();
        let size = batch.requests.len();
        debug!(batch_id = %batch.batch_id, size, "processing batch");

        let groups = self.plan(batch.requests);
        let outcomes = join_all(groups.iter().map(|group| async move {
            match &group.registration {
                Some(reg) => self.executor.execute(reg.clone(), &group.request).await,
                None => EntryOutcome::failed(WireError::handler_not_found(&group.request.method)),
            }
        }))
        .await;

        let mut responses = Vec::with_capacity(size);
        for (group, outcome) in groups.into_iter().zip(outcomes) {
            for id in group.ids {
                let entry = match &outcome.result {
                    Ok(data) => ResponseEntry::ok(id, data.clone(), outcome.elapsed),
                    Err(e) => {
                        warn!(
                            batch_id = %batch.batch_id,
                            request_id = %id,
                            method = %group.request.method,
                            kind = %e.kind,
                            "batched request failed"
                        );
                        ResponseEntry::failed(id, e.clone(), outcome.elapsed)
                    }
                };
                responses.push(entry);
            }
        }

        let elapsed = started.elapsed();
        let response = ResponseBatch::new(batch.batch_id, responses, elapsed);
        self.stats
            .record_batch(size, response.metadata.errors, elapsed);
        debug!(
            batch_id = %response.batch_id,
            processed = response.metadata.processed,
            errors = response.metadata.errors,
            total_ms = response.metadata.total_time,
            "batch complete"
        );
        Ok(response)
    }

    /// Serialized entry point: JSON batch in, JSON response out.
    pub async fn process_json(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let batch = RequestBatch::from_slice(payload)?;
        let response = self.process_batch(batch).await?;
        Ok(serde_json::to_vec(&response)?)
    }

    pub fn stats(&self) -> BatchStats {
        self.stats.snapshot()
    }

    pub fn clear_stats(&self) {
        self.stats.clear();
    }

    /// Resolves handlers against one registry snapshot and folds identical
    /// cacheable entries into a single group. Entries only fold when they also
    /// carry the same deadline.
    fn plan(&self, requests: Vec<RequestEntry>) -> Vec<Group> {
        let table = self.registry.snapshot();
        let mut groups: Vec<Group> = Vec::with_capacity(requests.len());
        let mut shared: HashMap<(String, String, Option<u64>), usize> = HashMap::new();

        for request in requests {
            let registration = table.get(&request.method).cloned();
            if let Some(reg) = registration.as_ref().filter(|r| r.cacheable) {
                let params_key = serde_json::to_string(&request.params).unwrap_or_default();
                let key = (reg.method.clone(), params_key, request.timeout);
                if let Some(&idx) = shared.get(&key) {
                    groups[idx].ids.push(request.id);
                    continue;
                }
                shared.insert(key, groups.len());
            }
            groups.push(Group {
                ids: vec![request.id.clone()],
                request,
                registration,
            });
        }
        groups
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
