//! Per-key pending queues and their flush timers.
//!
//! Each batch key walks `EMPTY -> ACCUMULATING -> FLUSHING -> EMPTY`. A queue
//! instance is identified by a generation number; taking it out of the table is
//! the only way to flush it, so a size flush and a timer flush can never share
//! one snapshot.

use super::config::BatchConfig;
use crate::cache::CacheKey;
use crate::protocol::RequestEntry;
use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// One queued call and the slot its caller is waiting on.
pub(crate) struct Pending {
    pub entry: RequestEntry,
    pub cache_key: Option<CacheKey>,
    pub settle: oneshot::Sender<Result<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Timer,
    Manual,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Manual => "manual",
        }
    }
}

/// A queue instance removed from the table, ready to be submitted.
pub(crate) struct FlushSet {
    pub key: String,
    pub generation: u64,
    pub policy: Arc<BatchConfig>,
    pub items: Vec<Pending>,
    pub trigger: FlushTrigger,
    pub waited: Duration,
}

struct KeyQueue {
    generation: u64,
    policy: Arc<BatchConfig>,
    items: Vec<Pending>,
    timer: Option<JoinHandle<()>>,
    started: Instant,
}

impl KeyQueue {
    fn into_flush(mut self, key: String, trigger: FlushTrigger) -> FlushSet {
        if let Some(timer) = self.timer.take() {
            // The timer task never aborts itself; it just lets its handle go.
            if trigger != FlushTrigger::Timer {
                timer.abort();
            }
        }
        FlushSet {
            key,
            generation: self.generation,
            policy: self.policy,
            items: self.items,
            trigger,
            waited: self.started.elapsed(),
        }
    }
}

pub(crate) enum EnqueueOutcome {
    /// The queue reached its size limit and was taken out.
    Full(FlushSet),
    /// A fresh queue was started; the caller must arm its timer.
    Started { generation: u64, wait: Duration },
    Queued,
}

#[derive(Default)]
pub(crate) struct QueueTable {
    queues: HashMap<String, KeyQueue>,
    next_generation: u64,
}

impl QueueTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `pending` to the queue for `key`, starting one with `policy` if needed.
    pub fn push(&mut self, key: &str, policy: Arc<BatchConfig>, pending: Pending) -> EnqueueOutcome {
        let started = !self.queues.contains_key(key);
        if started {
            self.next_generation += 1;
            self.queues.insert(
                key.to_string(),
                KeyQueue {
                    generation: self.next_generation,
                    policy,
                    items: Vec::new(),
                    timer: None,
                    started: Instant::now(),
                },
            );
        }

        let Some(queue) = self.queues.get_mut(key) else {
            return EnqueueOutcome::Queued;
        };
        queue.items.push(pending);

        if queue.items.len() >= queue.policy.max_batch_size.max(1) {
            return match self.queues.remove(key) {
                Some(q) => EnqueueOutcome::Full(q.into_flush(key.to_string(), FlushTrigger::Size)),
                None => EnqueueOutcome::Queued,
            };
        }
        if started {
            EnqueueOutcome::Started {
                generation: queue.generation,
                wait: queue.policy.max_wait(),
            }
        } else {
            EnqueueOutcome::Queued
        }
    }

    /// Attaches the timer armed for `generation`. A queue that is already gone
    /// gets its timer aborted instead.
    pub fn attach_timer(&mut self, key: &str, generation: u64, timer: JoinHandle<()>) {
        match self.queues.get_mut(key) {
            Some(q) if q.generation == generation => q.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// Takes the queue for `key` only if it is still the instance the timer was armed for.
    pub fn take_expired(&mut self, key: &str, generation: u64) -> Option<FlushSet> {
        if self.queues.get(key).map(|q| q.generation) != Some(generation) {
            return None;
        }
        self.queues
            .remove(key)
            .map(|q| q.into_flush(key.to_string(), FlushTrigger::Timer))
    }

    /// Takes every queue, cancelling their timers.
    pub fn drain_all(&mut self) -> Vec<FlushSet> {
        self.queues
            .drain()
            .map(|(key, q)| q.into_flush(key, FlushTrigger::Manual))
            .collect()
    }

    pub fn pending(&self, key: &str) -> usize {
        self.queues.get(key).map(|q| q.items.len()).unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.queues.values().map(|q| q.items.len()).sum()
    }
}
