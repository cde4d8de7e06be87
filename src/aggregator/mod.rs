//! # Request Aggregator
//!
//! Caller side of the batching layer. Turns many small, independent calls into
//! few physical round trips without adding unbounded latency to any caller.
//!
//! ## Overview
//!
//! Calls are queued per *batch key*. A queue is flushed when it reaches its
//! policy's `max_batch_size`, or `max_wait_time` after its first entry arrived,
//! whichever comes first. The flushed entries travel as one [`RequestBatch`] over
//! a [`BatchTransport`]; the single response is demultiplexed by request id back
//! to each waiting caller.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`RequestAggregator`] | Entry point; cheap to clone, one per process by convention |
//! | [`AggregatorBuilder`] | Composition-root construction |
//! | [`BatchConfig`] | Named aggregation policy |
//! | [`AggregatorConfig`] | Default policy, cache and `timesSaved` settings |
//! | [`DashboardData`] | Composite result of the fixed dashboard batch |
//!
//! ## Example
//!
//! ```rust
//! use ipc_batch::aggregator::{BatchConfig, RequestAggregator, RequestOptions};
//! use ipc_batch::dispatcher::Dispatcher;
//! use ipc_batch::transport::InProcessTransport;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> ipc_batch::Result<()> {
//! let dispatcher = Arc::new(Dispatcher::new());
//! dispatcher.register_fn("double", |p| async move {
//!     Ok(json!(p[0].as_i64().unwrap_or(0) * 2))
//! });
//!
//! let aggregator = RequestAggregator::new(Arc::new(InProcessTransport::new(dispatcher)));
//! aggregator.add_batch_config("math", BatchConfig::new("math").with_max_batch_size(2))?;
//!
//! let opts = RequestOptions::new().with_batch_key("math");
//! let (a, b) = tokio::join!(
//!     aggregator.execute_request("double", vec![json!(2)], opts.clone()),
//!     aggregator.execute_request("double", vec![json!(5)], opts),
//! );
//! assert_eq!(a?, json!(4));
//! assert_eq!(b?, json!(10));
//! assert_eq!(aggregator.stats().total_batches, 1);
//! # Ok(())
//! # }
//! ```

mod config;
mod dashboard;
mod queue;

pub use config::{AggregatorConfig, BatchConfig, BatchConfigSet, MethodDescriptor};
pub use dashboard::{dashboard_batch_config, DashboardData, DASHBOARD_BATCH_KEY, DASHBOARD_METHODS};
pub use queue::FlushTrigger;

use crate::cache::{CacheBackend, CacheConfig, CacheKey, CacheKeyGenerator, CacheManager, MemoryCache};
use crate::protocol::{ErrorKind, Priority, RequestBatch, RequestEntry, ResponseBatch};
use crate::stats::{BatchStats, StatsRecorder};
use crate::transport::BatchTransport;
use crate::{Error, ErrorContext, Result};
use futures::future::join_all;
use queue::{EnqueueOutcome, FlushSet, Pending, QueueTable};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Batch key used when a call names none.
pub const DEFAULT_BATCH_KEY: &str = "default";

/// Per-call options for [`RequestAggregator::execute_request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub batch_key: Option<String>,
    pub priority: Option<Priority>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_batch_key(mut self, key: impl Into<String>) -> Self {
        self.batch_key = Some(key.into());
        self
    }
    pub fn with_priority(mut self, p: Priority) -> Self {
        self.priority = Some(p);
        self
    }
    pub fn with_timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

pub struct AggregatorBuilder {
    transport: Arc<dyn BatchTransport>,
    config: AggregatorConfig,
    cache_backend: Option<Box<dyn CacheBackend>>,
    policies: Vec<(String, BatchConfig)>,
}

impl AggregatorBuilder {
    pub fn new(transport: Arc<dyn BatchTransport>) -> Self {
        Self {
            transport,
            config: AggregatorConfig::default(),
            cache_backend: None,
            policies: Vec::new(),
        }
    }

    pub fn config(mut self, config: AggregatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default in-memory LRU cache.
    pub fn cache_backend(mut self, backend: Box<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    pub fn batch_config(mut self, key: impl Into<String>, config: BatchConfig) -> Self {
        self.policies.push((key.into(), config));
        self
    }

    pub fn build(self) -> Result<RequestAggregator> {
        self.config.default_policy.validate()?;
        let mut policies = HashMap::new();
        for (key, cfg) in self.policies {
            cfg.validate()?;
            policies.insert(key, Arc::new(cfg));
        }
        Ok(RequestAggregator {
            inner: Arc::new(Inner::new(
                self.transport,
                self.config,
                self.cache_backend,
                policies,
            )),
        })
    }
}

/// Coalesces independent calls into batches. Clones share one instance.
#[derive(Clone)]
pub struct RequestAggregator {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn BatchTransport>,
    config: AggregatorConfig,
    default_policy: Arc<BatchConfig>,
    policies: RwLock<HashMap<String, Arc<BatchConfig>>>,
    queues: Mutex<QueueTable>,
    cache: CacheManager,
    keys: CacheKeyGenerator,
    stats: StatsRecorder,
    next_id: AtomicU64,
    closed: AtomicBool,
    flushes: TaskTracker,
}

impl RequestAggregator {
    /// Aggregator with default settings over `transport`.
    pub fn new(transport: Arc<dyn BatchTransport>) -> Self {
        Self {
            inner: Arc::new(Inner::new(
                transport,
                AggregatorConfig::default(),
                None,
                HashMap::new(),
            )),
        }
    }

    pub fn builder(transport: Arc<dyn BatchTransport>) -> AggregatorBuilder {
        AggregatorBuilder::new(transport)
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.inner.config
    }

    /// Queues one call under its batch key and waits for that call's own result.
    pub async fn execute_request(
        &self,
        method: &str,
        params: Vec<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let key = options
            .batch_key
            .unwrap_or_else(|| DEFAULT_BATCH_KEY.to_string());
        let policy = inner.policy_for(&key);
        let descriptor = policy.descriptor(method);

        let cache_key = inner.cache_key(&policy, method, &params);
        if let Some(ck) = &cache_key {
            if let Some(value) = inner.cached(ck).await {
                trace!(method, batch_key = %key, "served from cache");
                return Ok(value);
            }
        }

        let id = format!("req-{}", inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entry = RequestEntry::new(id, method).with_params(params);
        entry.priority = options.priority;
        entry.timeout = options
            .timeout
            .map(|t| t.as_millis() as u64)
            .or_else(|| descriptor.and_then(|d| d.timeout));

        let (settle, rx) = oneshot::channel();
        inner.enqueue(
            &key,
            policy.clone(),
            Pending {
                entry,
                cache_key,
                settle,
            },
        )?;

        rx.await.map_err(|_| {
            Error::runtime_with_context(
                "batched request was dropped before it settled",
                ErrorContext::new().with_source("aggregator"),
            )
        })?
    }

    /// Installs or replaces the policy for `key`. Queues already accumulating
    /// under `key` keep the policy they started with.
    pub fn add_batch_config(&self, key: impl Into<String>, config: BatchConfig) -> Result<()> {
        config.validate()?;
        let key = key.into();
        debug!(batch_key = %key, max_batch_size = config.max_batch_size, max_wait_ms = config.max_wait_time, "installing batch config");
        self.inner
            .policies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::new(config));
        Ok(())
    }

    /// Installs every policy of a loaded set under its own name.
    pub fn add_batch_configs(&self, set: BatchConfigSet) -> Result<()> {
        for cfg in set.batches {
            self.add_batch_config(cfg.name.clone(), cfg)?;
        }
        Ok(())
    }

    pub fn batch_config(&self, key: &str) -> BatchConfig {
        self.inner.policy_for(key).as_ref().clone()
    }

    pub fn pending_requests(&self, key: &str) -> usize {
        self.inner.lock_queues().pending(key)
    }

    /// Calls queued across every batch key.
    pub fn total_pending(&self) -> usize {
        self.inner.lock_queues().total_pending()
    }

    /// Flushes every non-empty queue now and waits for their callers to settle.
    pub async fn flush_all(&self) -> usize {
        let flushes: Vec<_> = {
            let mut table = self.inner.lock_queues();
            table
                .drain_all()
                .into_iter()
                .map(|set| self.inner.spawn_flush(set))
                .collect()
        };
        let n = flushes.len();
        join_all(flushes).await;
        n
    }

    /// Stops accepting calls, flushes every outstanding queue and waits until
    /// every in-flight flush has settled its callers.
    pub async fn shutdown(&self) {
        let sets = {
            let mut table = self.inner.lock_queues();
            self.inner.closed.store(true, Ordering::SeqCst);
            table.drain_all()
        };
        info!(queues = sets.len(), "shutting down request aggregator");
        for set in sets {
            self.inner.spawn_flush(set);
        }
        self.inner.flushes.close();
        self.inner.flushes.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BatchStats {
        self.inner.stats.snapshot()
    }

    pub fn clear_stats(&self) {
        self.inner.stats.clear();
    }

    /// Drops every cached result.
    pub async fn clear_cache(&self) -> Result<()> {
        debug!(backend = self.inner.cache.backend_name(), "clearing result cache");
        self.inner.cache.clear().await
    }
}

impl Inner {
    fn new(
        transport: Arc<dyn BatchTransport>,
        config: AggregatorConfig,
        cache_backend: Option<Box<dyn CacheBackend>>,
        mut policies: HashMap<String, Arc<BatchConfig>>,
    ) -> Self {
        policies
            .entry(DASHBOARD_BATCH_KEY.to_string())
            .or_insert_with(|| Arc::new(dashboard_batch_config()));
        let backend =
            cache_backend.unwrap_or_else(|| Box::new(MemoryCache::new(config.cache_capacity)));
        Self {
            transport,
            default_policy: Arc::new(config.default_policy.clone()),
            cache: CacheManager::new(CacheConfig::new().with_ttl(config.cache_ttl), backend),
            config,
            policies: RwLock::new(policies),
            queues: Mutex::new(QueueTable::new()),
            keys: CacheKeyGenerator::new(),
            stats: StatsRecorder::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            flushes: TaskTracker::new(),
        }
    }

    fn lock_queues(&self) -> MutexGuard<'_, QueueTable> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn policy_for(&self, key: &str) -> Arc<BatchConfig> {
        self.policies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::runtime_with_context(
                "aggregator is shut down",
                ErrorContext::new().with_source("aggregator"),
            ));
        }
        Ok(())
    }

    /// Key for `method` when its descriptor under `policy` is cacheable.
    fn cache_key(&self, policy: &BatchConfig, method: &str, params: &[Value]) -> Option<CacheKey> {
        match policy.descriptor(method) {
            Some(d) if d.cacheable && self.cache.is_enabled() => Some(self.keys.generate(method, params)),
            _ => None,
        }
    }

    /// Cache lookup counted toward `cacheHitRate`. A hit is a request that never travels.
    async fn cached(&self, key: &CacheKey) -> Option<Value> {
        let hit = self.cache.get::<Value>(key).await.unwrap_or_else(|e| {
            debug!(error = %e, "cache lookup failed; treating as miss");
            None
        });
        self.stats.record_cache_lookup(hit.is_some());
        if hit.is_some() {
            self.stats.record_unbatched_request();
        }
        hit
    }

    async fn store(&self, key: &CacheKey, value: &Value) {
        if let Err(e) = self.cache.set(key, value).await {
            debug!(error = %e, "failed to cache result");
        }
    }

    /// Queue mutation, timer arming and flush spawning all happen under the
    /// queue lock, so `shutdown` sees every flush a drained queue produced.
    fn enqueue(self: &Arc<Self>, key: &str, policy: Arc<BatchConfig>, pending: Pending) -> Result<()> {
        let mut table = self.lock_queues();
        self.ensure_open()?;

        match table.push(key, policy, pending) {
            EnqueueOutcome::Full(set) => {
                self.spawn_flush(set);
            }
            EnqueueOutcome::Started { generation, wait } => {
                let inner = Arc::clone(self);
                let timer_key = key.to_string();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    inner.flush_expired(&timer_key, generation);
                });
                table.attach_timer(key, generation, timer);
            }
            EnqueueOutcome::Queued => {}
        }
        Ok(())
    }

    fn flush_expired(self: &Arc<Self>, key: &str, generation: u64) {
        let mut table = self.lock_queues();
        if let Some(set) = table.take_expired(key, generation) {
            self.spawn_flush(set);
        }
    }

    /// Flushes run on the tracker that `shutdown` waits on.
    fn spawn_flush(self: &Arc<Self>, set: FlushSet) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        self.flushes.spawn(async move { inner.flush(set).await })
    }

    /// Sends one batch and checks it came back for the same batch id.
    async fn submit(&self, batch: RequestBatch) -> Result<ResponseBatch> {
        let expected = batch.batch_id.clone();
        let response = self.transport.send(batch).await?;
        if response.batch_id != expected {
            return Err(Error::runtime_with_context(
                format!(
                    "response batch id '{}' does not match submitted '{}'",
                    response.batch_id, expected
                ),
                ErrorContext::new().with_source(self.transport.name()),
            ));
        }
        Ok(response)
    }

    async fn flush(&self, set: FlushSet) {
        let FlushSet {
            key,
            generation,
            policy,
            items,
            trigger,
            waited,
        } = set;
        let size = items.len();
        if size == 0 {
            return;
        }

        let mut requests = Vec::with_capacity(size);
        let mut waiters = HashMap::with_capacity(size);
        for p in items {
            waiters.insert(p.entry.id.clone(), (p.settle, p.cache_key));
            requests.push(p.entry);
        }
        let batch = RequestBatch::with_generated_id(requests);
        debug!(
            batch_key = %key,
            batch_id = %batch.batch_id,
            generation,
            size,
            max_batch_size = policy.max_batch_size,
            trigger = trigger.as_str(),
            waited_ms = waited.as_millis() as u64,
            "flushing batch"
        );

        let started = Instant::now();
        let outcome = self.submit(batch).await;
        let rtt = started.elapsed();

        match outcome {
            Ok(response) => {
                let batch_id = response.batch_id.clone();
                let mut by_id = response.into_map();
                let mut errors = 0;
                for (id, (settle, cache_key)) in waiters {
                    let result = match by_id.remove(&id) {
                        Some(entry) => entry.into_result().map_err(Error::from),
                        None => Err(Error::remote(
                            ErrorKind::HandlerError,
                            format!("response batch '{}' has no entry for request '{}'", batch_id, id),
                        )),
                    };
                    match (&result, cache_key) {
                        (Ok(value), Some(ck)) => self.store(&ck, value).await,
                        (Err(_), _) => errors += 1,
                        _ => {}
                    }
                    let _ = settle.send(result);
                }
                self.record_round_trip(size, errors, rtt);
            }
            Err(e) => {
                warn!(batch_key = %key, size, error = %e, "batch submission failed; rejecting queued callers");
                let message = format!("batch transport failed: {}", e);
                for (_, (settle, _)) in waiters {
                    let _ = settle.send(Err(Error::remote(ErrorKind::HandlerError, message.clone())));
                }
                self.stats.record_batch(size, size, rtt);
            }
        }
    }

    /// One-entry submission outside the queues.
    async fn call_single(&self, entry: RequestEntry) -> Result<Value> {
        let id = entry.id.clone();
        let started = Instant::now();
        let outcome = self.submit(RequestBatch::with_generated_id(vec![entry])).await;
        let rtt = started.elapsed();
        let result = outcome.and_then(|response| {
            response
                .into_map()
                .remove(&id)
                .ok_or_else(|| Error::remote(ErrorKind::HandlerError, format!("no response entry for request '{}'", id)))
                .and_then(|e| e.into_result().map_err(Error::from))
        });
        self.stats.record_batch(1, usize::from(result.is_err()), rtt);
        result
    }

    fn record_round_trip(&self, size: usize, errors: usize, rtt: Duration) {
        self.stats.record_batch(size, errors, rtt);
        let saved = self
            .config
            .estimated_request_latency
            .checked_mul(size as u32)
            .and_then(|individual| individual.checked_sub(rtt));
        if let Some(saved) = saved {
            self.stats.record_time_saved(saved);
        }
    }
}
