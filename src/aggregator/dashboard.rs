//! Fixed composite dashboard fetch.
//!
//! Six read-only sources travel as one direct submission. When that
//! submission fails the sources are fetched one by one, each with retry, and
//! the result is marked degraded.

use super::config::{BatchConfig, MethodDescriptor};
use super::{Inner, RequestAggregator};
use crate::cache::CacheKey;
use crate::protocol::{ErrorKind, Priority, RequestBatch, RequestEntry};
use crate::resilience::retry::retry;
use crate::{Error, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const DASHBOARD_BATCH_KEY: &str = "dashboard";

pub const GET_METRICS: &str = "get_metrics";
pub const GET_PERFORMANCE_METRICS: &str = "get_performance_metrics";
pub const GET_HEALTH_STATUS: &str = "get_health_status";
pub const GET_KB_STATS: &str = "get_kb_stats";
pub const GET_RECENT_QUERIES: &str = "get_recent_queries";
pub const GET_STORAGE_INFO: &str = "get_storage_info";

/// Sources in submission order. The request id of each entry is its method name.
pub const DASHBOARD_METHODS: [&str; 6] = [
    GET_METRICS,
    GET_PERFORMANCE_METRICS,
    GET_HEALTH_STATUS,
    GET_KB_STATS,
    GET_RECENT_QUERIES,
    GET_STORAGE_INFO,
];

pub fn dashboard_batch_config() -> BatchConfig {
    let timeout = Duration::from_secs(5);
    BatchConfig::new(DASHBOARD_BATCH_KEY)
        .with_max_batch_size(DASHBOARD_METHODS.len())
        .with_max_wait_time(Duration::from_millis(25))
        .with_priority(Priority::High)
        .with_method(MethodDescriptor::new(GET_METRICS).with_description("system metrics").with_timeout(timeout))
        .with_method(
            MethodDescriptor::new(GET_PERFORMANCE_METRICS)
                .with_description("latency and throughput")
                .with_timeout(timeout),
        )
        .with_method(MethodDescriptor::new(GET_HEALTH_STATUS).with_description("component health").with_timeout(timeout))
        .with_method(
            MethodDescriptor::new(GET_KB_STATS)
                .with_description("knowledge base statistics")
                .cacheable(true)
                .with_timeout(timeout),
        )
        .with_method(MethodDescriptor::new(GET_RECENT_QUERIES).with_description("recent queries").with_timeout(timeout))
        .with_method(
            MethodDescriptor::new(GET_STORAGE_INFO)
                .with_description("storage usage")
                .cacheable(true)
                .with_timeout(timeout),
        )
}

/// Dashboard sources; a `None` field is a source that failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardData {
    pub metrics: Option<Value>,
    pub performance_metrics: Option<Value>,
    pub health_status: Option<Value>,
    pub kb_stats: Option<Value>,
    pub recent_queries: Option<Value>,
    pub storage_info: Option<Value>,
    /// Set when the batched submission failed and sources were fetched individually.
    pub degraded: bool,
    pub failed_sources: Vec<String>,
}

impl DashboardData {
    fn slot(&mut self, method: &str) -> Option<&mut Option<Value>> {
        match method {
            GET_METRICS => Some(&mut self.metrics),
            GET_PERFORMANCE_METRICS => Some(&mut self.performance_metrics),
            GET_HEALTH_STATUS => Some(&mut self.health_status),
            GET_KB_STATS => Some(&mut self.kb_stats),
            GET_RECENT_QUERIES => Some(&mut self.recent_queries),
            GET_STORAGE_INFO => Some(&mut self.storage_info),
            _ => None,
        }
    }

    fn settle(&mut self, method: &str, result: Result<Value>) {
        match result {
            Ok(value) => {
                if let Some(slot) = self.slot(method) {
                    *slot = Some(value);
                }
            }
            Err(e) => {
                warn!(method, error = %e, "dashboard source failed");
                self.failed_sources.push(method.to_string());
            }
        }
    }

    /// Names of the sources that produced a value.
    pub fn available_sources(&self) -> Vec<&'static str> {
        let present = [
            self.metrics.is_some(),
            self.performance_metrics.is_some(),
            self.health_status.is_some(),
            self.kb_stats.is_some(),
            self.recent_queries.is_some(),
            self.storage_info.is_some(),
        ];
        DASHBOARD_METHODS
            .into_iter()
            .zip(present)
            .filter_map(|(m, ok)| ok.then_some(m))
            .collect()
    }
}

fn dashboard_entry(policy: &BatchConfig, method: &str) -> RequestEntry {
    let mut entry = RequestEntry::new(method, method).with_priority(policy.priority);
    entry.timeout = policy.descriptor(method).and_then(|d| d.timeout);
    entry
}

impl RequestAggregator {
    /// Fetches every dashboard source in one round trip.
    ///
    /// Cacheable sources with a live cache entry are taken from the cache and
    /// only the rest travel. Fails only when no source could be fetched at all.
    /// A missing `metrics` source is replaced by a summary derived from the others.
    pub async fn execute_dashboard_batch(&self) -> Result<DashboardData> {
        let inner: &Inner = &self.inner;
        inner.ensure_open()?;
        let policy = inner.policy_for(DASHBOARD_BATCH_KEY);

        let mut data = DashboardData::default();
        let mut cache_keys: HashMap<&str, CacheKey> = HashMap::new();
        let mut misses = Vec::with_capacity(DASHBOARD_METHODS.len());
        for method in DASHBOARD_METHODS {
            if let Some(ck) = inner.cache_key(&policy, method, &[]) {
                if let Some(value) = inner.cached(&ck).await {
                    trace!(method, "dashboard source served from cache");
                    data.settle(method, Ok(value));
                    continue;
                }
                cache_keys.insert(method, ck);
            }
            misses.push(method);
        }

        if !misses.is_empty() {
            let entries: Vec<RequestEntry> = misses.iter().map(|m| dashboard_entry(&policy, m)).collect();
            let size = entries.len();
            let started = Instant::now();
            let outcome = inner.submit(RequestBatch::with_generated_id(entries)).await;
            let rtt = started.elapsed();

            let results: Vec<(&str, Result<Value>)> = match outcome {
                Ok(response) => {
                    let mut by_id = response.into_map();
                    let results: Vec<_> = misses
                        .iter()
                        .map(|&method| {
                            let result = match by_id.remove(method) {
                                Some(entry) => entry.into_result().map_err(Error::from),
                                None => Err(Error::remote(
                                    ErrorKind::HandlerError,
                                    format!("no response entry for '{}'", method),
                                )),
                            };
                            (method, result)
                        })
                        .collect();
                    let errors = results.iter().filter(|(_, r)| r.is_err()).count();
                    inner.record_round_trip(size, errors, rtt);
                    results
                }
                Err(e) => {
                    warn!(error = %e, "dashboard batch failed; falling back to individual calls");
                    inner.stats.record_batch(size, size, rtt);
                    data.degraded = true;

                    let retry_cfg = &inner.config.retry;
                    let calls = misses.iter().map(|&method| {
                        let entry = dashboard_entry(&policy, method);
                        async move {
                            let result = retry(retry_cfg, || inner.call_single(entry.clone())).await;
                            (method, result)
                        }
                    });
                    join_all(calls).await
                }
            };

            for (method, result) in results {
                if let (Ok(value), Some(ck)) = (&result, cache_keys.get(method)) {
                    inner.store(ck, value).await;
                }
                data.settle(method, result);
            }
        }

        if data.failed_sources.len() == DASHBOARD_METHODS.len() {
            return Err(Error::remote(
                ErrorKind::HandlerError,
                "every dashboard source failed",
            ));
        }
        if data.metrics.is_none() {
            debug!("deriving dashboard metrics from the remaining sources");
            data.metrics = Some(json!({
                "derived": true,
                "availableSources": data.available_sources(),
                "failedSources": data.failed_sources,
            }));
        }
        Ok(data)
    }
}
