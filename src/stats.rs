//! Process-lifetime batch statistics shared by both sides of the wire.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// Snapshot of the accumulated counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub total_batches: u64,
    pub total_requests: u64,
    pub average_batch_size: f64,
    /// Mean wall-clock milliseconds per batch.
    pub average_execution_time: f64,
    pub cache_hit_rate: f64,
    pub error_rate: f64,
    /// Estimated cumulative milliseconds avoided by batching.
    pub times_saved: f64,
}

#[derive(Debug, Default)]
struct Counters {
    total_batches: u64,
    total_requests: u64,
    batched_requests: u64,
    total_errors: u64,
    total_execution_ms: f64,
    cache_lookups: u64,
    cache_hits: u64,
    times_saved_ms: f64,
}

impl Counters {
    fn snapshot(&self) -> BatchStats {
        let ratio = |num: f64, den: u64| if den == 0 { 0.0 } else { num / den as f64 };
        BatchStats {
            total_batches: self.total_batches,
            total_requests: self.total_requests,
            average_batch_size: ratio(self.batched_requests as f64, self.total_batches),
            average_execution_time: ratio(self.total_execution_ms, self.total_batches),
            cache_hit_rate: ratio(self.cache_hits as f64, self.cache_lookups),
            error_rate: ratio(self.total_errors as f64, self.total_requests),
            times_saved: self.times_saved_ms,
        }
    }
}

/// Mutex-serialized accumulator; every update and `clear` is atomic with respect to the others.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    inner: Mutex<Counters>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Counters) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Records one completed batch of `size` entries, `errors` of which failed.
    pub fn record_batch(&self, size: usize, errors: usize, elapsed: Duration) {
        self.with(|c| {
            c.total_batches += 1;
            c.total_requests += size as u64;
            c.batched_requests += size as u64;
            c.total_errors += errors as u64;
            c.total_execution_ms += elapsed.as_secs_f64() * 1000.0;
        });
    }

    /// Counts a request that never reached a batch (served locally).
    pub fn record_unbatched_request(&self) {
        self.with(|c| c.total_requests += 1);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        self.with(|c| {
            c.cache_lookups += 1;
            if hit {
                c.cache_hits += 1;
            }
        });
    }

    pub fn record_time_saved(&self, saved: Duration) {
        self.with(|c| c.times_saved_ms += saved.as_secs_f64() * 1000.0);
    }

    pub fn snapshot(&self) -> BatchStats {
        self.with(|c| c.snapshot())
    }

    pub fn clear(&self) {
        self.with(|c| *c = Counters::default());
    }
}
