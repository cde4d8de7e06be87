//! Entry executor: admission control and the handler/deadline race.

use super::registry::HandlerRegistration;
use crate::protocol::{RequestEntry, WireError};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::warn;

/// Settled outcome of one handler invocation.
#[derive(Debug, Clone)]
pub(crate) struct EntryOutcome {
    pub result: std::result::Result<Value, WireError>,
    pub elapsed: Duration,
}

impl EntryOutcome {
    pub fn failed(error: WireError) -> Self {
        Self {
            result: Err(error),
            elapsed: Duration::ZERO,
        }
    }
}

/// Occupancy of the admission slots, facts only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflightSnapshot {
    pub max: usize,
    pub available: usize,
    pub in_use: usize,
}

pub(crate) struct EntryExecutor {
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    default_timeout: Duration,
}

impl EntryExecutor {
    pub fn new(max_concurrent: usize, default_timeout: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            default_timeout,
        }
    }

    pub fn inflight(&self) -> InflightSnapshot {
        let available = self.slots.available_permits();
        InflightSnapshot {
            max: self.max_concurrent,
            available,
            in_use: self.max_concurrent.saturating_sub(available),
        }
    }

    /// Effective deadline: request override, then registration default, then system default.
    pub fn deadline_for(&self, registration: &HandlerRegistration, request: &RequestEntry) -> Duration {
        request
            .timeout_duration()
            .or(registration.default_timeout)
            .unwrap_or(self.default_timeout)
    }

    /// Runs one handler under an admission slot, racing it against its deadline.
    ///
    /// The handler runs on its own task. If the deadline wins, the join handle is
    /// dropped: the task keeps running but its result has nowhere to go.
    pub async fn execute(
        &self,
        registration: Arc<HandlerRegistration>,
        request: &RequestEntry,
    ) -> EntryOutcome {
        // Waiters are served FIFO by the semaphore.
        let _permit = match self.slots.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                return EntryOutcome::failed(WireError::handler_error(
                    "dispatcher admission slots closed",
                ))
            }
        };

        let deadline = self.deadline_for(&registration, request);
        let handler = registration.handler.clone();
        let params = request.params.clone();
        let started = Instant::now();
        let task = tokio::spawn(async move { handler.invoke(params).await });

        let result = match tokio::time::timeout(deadline, task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(WireError::handler_error(format!("{:#}", e))),
            Ok(Err(join_err)) if join_err.is_panic() => Err(WireError::handler_error(format!(
                "handler for '{}' panicked",
                request.method
            ))),
            Ok(Err(_)) => Err(WireError::handler_error(format!(
                "handler for '{}' was cancelled",
                request.method
            ))),
            Err(_) => {
                warn!(
                    method = %request.method,
                    request_id = %request.id,
                    timeout_ms = deadline.as_millis() as u64,
                    "handler exceeded its deadline; late result will be discarded"
                );
                Err(WireError::timeout(&request.method, deadline.as_millis() as u64))
            }
        };

        EntryOutcome {
            result,
            elapsed: started.elapsed(),
        }
    }
}
