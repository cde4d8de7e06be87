//! # ipc-batch
//!
//! Inter-process request batching: many small, independent calls from one
//! process are coalesced into few physical round trips to another process,
//! which executes them concurrently and answers with one response per call.
//!
//! ## Overview
//!
//! The crate has two halves joined by a JSON wire contract:
//!
//! - **Request Aggregator** (caller side): queues calls per batch key and flushes
//!   a queue when it is full or its wait time expires. Each caller gets back only
//!   its own result, success or failure.
//! - **Batch Dispatcher** (executor side): resolves every entry of a batch against
//!   a handler registry and runs the entries concurrently under a bounded number
//!   of slots, each with a deadline. One failing entry never fails the batch.
//!
//! ## Quick Start
//!
//! ```rust
//! use ipc_batch::{Dispatcher, RequestAggregator, RequestOptions};
//! use ipc_batch::transport::InProcessTransport;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> ipc_batch::Result<()> {
//!     let dispatcher = Arc::new(Dispatcher::new());
//!     dispatcher.register_fn("greet", |params| async move {
//!         let name = params.first().and_then(|v| v.as_str()).unwrap_or("world").to_string();
//!         Ok(json!(format!("hello, {name}")))
//!     });
//!
//!     let aggregator = RequestAggregator::new(Arc::new(InProcessTransport::new(dispatcher)));
//!     let reply = aggregator
//!         .execute_request("greet", vec![json!("ipc")], RequestOptions::new())
//!         .await?;
//!     assert_eq!(reply, json!("hello, ipc"));
//!
//!     aggregator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`protocol`] | Wire contract: batches, entries, error kinds |
//! | [`dispatcher`] | Handler registry and bounded concurrent execution |
//! | [`aggregator`] | Per-key queues, flush triggers, demultiplexing, dashboard batch |
//! | [`transport`] | Carriers between the two halves (in-process, HTTP) |
//! | [`cache`] | TTL result cache for cacheable methods |
//! | [`resilience`] | Retry with backoff |
//! | [`stats`] | Running batch statistics |

pub mod aggregator;
pub mod cache;
pub mod dispatcher;
pub mod protocol;
pub mod resilience;
pub mod stats;
pub mod transport;

// Re-export main types for convenience
pub use aggregator::{AggregatorBuilder, BatchConfig, DashboardData, RequestAggregator, RequestOptions};
pub use dispatcher::{Dispatcher, DispatcherConfig, Handler};
pub use protocol::{ErrorKind, Priority, RequestBatch, RequestEntry, ResponseBatch, ResponseEntry};
pub use stats::BatchStats;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
