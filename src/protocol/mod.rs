//! # Wire Contract
//!
//! The records exchanged between the [`aggregator`](crate::aggregator) and the
//! [`dispatcher`](crate::dispatcher). They are transport-agnostic: any carrier
//! able to move JSON bytes (an in-process call, a pipe, an HTTP body) can ship them.
//!
//! ## Module Structure
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`request`] | `RequestEntry` / `RequestBatch` and input-contract validation |
//! | [`response`] | `ResponseEntry` / `ResponseBatch` with per-entry outcome |
//! | [`error`] | `ErrorKind` taxonomy carried by failed entries |
//!
//! ## Invariants
//!
//! - `ResponseBatch.batch_id == RequestBatch.batch_id`
//! - every request id appears exactly once in the response, in no particular order
//!
//! ## Example
//!
//! ```rust
//! use ipc_batch::protocol::{RequestBatch, RequestEntry};
//! use serde_json::json;
//!
//! let batch = RequestBatch::new(
//!     "batch-1",
//!     vec![RequestEntry::new("1", "get_metrics").with_params(vec![json!("24h")])],
//! );
//! assert!(batch.validate().is_ok());
//! ```

pub mod error;
pub mod request;
pub mod response;

pub use error::{ErrorKind, WireError};
pub use request::{Priority, RequestBatch, RequestEntry};
pub use response::{BatchMetadata, EntryMetadata, ResponseBatch, ResponseEntry};
