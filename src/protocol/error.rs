//! Wire-level error kinds carried inside a `ResponseEntry`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical failure classification shared by both sides of the wire.
///
/// Every failed `ResponseEntry` carries exactly one of these kinds. The
/// serialized form is the upper snake case name (e.g. `"HANDLER_NOT_FOUND"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// No registry entry exists for the requested method
    HandlerNotFound,
    /// The handler did not settle before its effective deadline
    Timeout,
    /// The handler failed, or the whole batch transport failed
    HandlerError,
    /// The batch itself violated the input contract
    MalformedBatch,
}

impl ErrorKind {
    /// Returns the wire name (e.g., `"TIMEOUT"`).
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::HandlerNotFound => "HANDLER_NOT_FOUND",
            Self::Timeout => "TIMEOUT",
            Self::HandlerError => "HANDLER_ERROR",
            Self::MalformedBatch => "MALFORMED_BATCH",
        }
    }

    /// Returns whether resubmitting the same request may succeed.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::HandlerError)
    }

    /// Parses a wire name. Unknown names return `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "HANDLER_NOT_FOUND" => Self::HandlerNotFound,
            "TIMEOUT" => Self::Timeout,
            "HANDLER_ERROR" => Self::HandlerError,
            "MALFORMED_BATCH" => Self::MalformedBatch,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Failure payload of a single response entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn handler_not_found(method: &str) -> Self {
        Self::new(
            ErrorKind::HandlerNotFound,
            format!("no handler registered for method '{}'", method),
        )
    }

    pub fn timeout(method: &str, after_ms: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("request timeout: '{}' did not complete within {}ms", method, after_ms),
        )
    }

    pub fn handler_error(detail: impl fmt::Display) -> Self {
        Self::new(ErrorKind::HandlerError, detail.to_string())
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
