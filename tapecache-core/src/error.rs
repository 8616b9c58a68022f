use std::borrow::Cow;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, TapeError>;

/// Canonical error surface for tapecache-core.
#[derive(Debug, Error)]
pub enum TapeError {
    #[error("I/O error: {source}")]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    #[error("Queue storage is corrupt: {reason}")]
    Corrupt { reason: Cow<'static, str> },

    #[error("Storage is closed")]
    Closed,

    #[error("Position {position} with count {count} is out of bounds for length {length}")]
    OutOfBounds {
        position: u64,
        count: u64,
        length: u64,
    },

    #[error("Cannot resize storage to {requested} bytes (allowed range {minimum}..={maximum})")]
    InvalidResize {
        requested: u64,
        minimum: u64,
        maximum: u64,
    },

    #[error(
        "Capacity exceeded. Used: {used} bytes, Limit: {limit} bytes, Required: {required} bytes"
    )]
    CapacityExceeded { used: u64, limit: u64, required: u64 },

    #[error("Cannot remove {requested} elements, queue only holds {available}")]
    NotEnoughElements { requested: usize, available: usize },

    #[error("Queue was modified while it was being iterated")]
    ConcurrentModification,

    #[error("Record validation failed: {reason}")]
    Validation { reason: String },

    #[error("Schema could not be parsed: {reason}")]
    Schema { reason: String },

    #[error("Cache {path} is deprecated and only accepts reads and removals")]
    ReadOnly { path: PathBuf },

    #[error("No free cache slot left for topic '{topic}'")]
    NoFreeSlot { topic: String },

    #[error("Lock acquisition failed: {0}")]
    Lock(String),

    #[error("Cache worker is no longer running")]
    WorkerStopped,

    #[error("Cache job panicked before returning a result")]
    JobPanicked,
}

impl TapeError {
    pub(crate) fn corrupt(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }

    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Whether the error means the backing file can no longer be trusted.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }

    /// Attaches a path to an I/O error that was raised without one.
    #[must_use]
    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        match self {
            Self::Io { source, path: None } => Self::Io {
                source,
                path: Some(path.into()),
            },
            other => other,
        }
    }
}

impl From<std::io::Error> for TapeError {
    fn from(source: std::io::Error) -> Self {
        // Errors raised inside `io::Write` adapters travel wrapped in an io::Error.
        match source.downcast::<TapeError>() {
            Ok(inner) => inner,
            Err(source) => Self::Io { source, path: None },
        }
    }
}

impl From<serde_json::Error> for TapeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Schema {
            reason: value.to_string(),
        }
    }
}
