//! Error types for proxima.

use thiserror::Error;

/// Errors that can occur while building, querying, or persisting an index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Rejected input: inconsistent dimensions, empty training data,
    /// out-of-range hyperparameters.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The on-disk model does not match what the caller asked to load
    /// (wrong implementation tag, unknown version, corrupt payload sizes).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Underlying file I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A condition that indicates a bug in this crate, never bad user input.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Result type alias for proxima operations.
pub type Result<T> = std::result::Result<T, IndexError>;

impl IndexError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        IndexError::InvalidConfiguration(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        IndexError::InvalidState(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        fn read_missing() -> Result<Vec<u8>> {
            Ok(std::fs::read("/definitely/not/a/real/path")?)
        }
        match read_missing() {
            Err(IndexError::Io(_)) => {}
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn display_includes_detail() {
        let e = IndexError::config("efC (4) must be >= M (16)");
        assert!(e.to_string().contains("efC"));
    }
}
