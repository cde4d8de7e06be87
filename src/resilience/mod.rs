//! # Resilience Primitives
//!
//! Opt-in helpers for calls that cross the process boundary.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`retry`] | Capped exponential backoff for retryable [`ErrorKind`](crate::protocol::ErrorKind)s |
//!
//! ```rust
//! use ipc_batch::resilience::retry::RetryConfig;
//! use std::time::Duration;
//!
//! let cfg = RetryConfig::new()
//!     .with_max_retries(3)
//!     .with_delays(Duration::from_millis(10), Duration::from_millis(200));
//! assert_eq!(cfg.backoff(1), Duration::from_millis(20));
//! ```

pub mod retry;
