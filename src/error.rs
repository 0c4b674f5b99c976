//! Custom error types for the sensor core.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different failure classes that occur between a caller and the sensor.
//!
//! ## Error Hierarchy
//!
//! - **`Transport`**: A link-level failure on send, read or buffer operations. Carries the
//!   raw (negative) library code and the human-readable string the library resolved for it.
//! - **`Protocol`**: A malformed or unexpected response shape, or a command that cannot be
//!   encoded (unknown argument tag, mnemonic too long, truncated payload).
//! - **`Correlation`**: A response referenced a ticket nobody is waiting on. Logged by the
//!   dispatcher, never fatal.
//! - **`Timeout`**: A bounded wait was exceeded (connection close, trigger-loss completion,
//!   acquisition teardown).
//! - **`State`**: The operation is not valid in the current mode, e.g. a blocking-only call
//!   issued on a non-blocking link, or any call on a closed link.
//! - **`InvalidSignalId`** / **`InvalidSampleNumber`**: Lookups against a decoded batch that
//!   fall outside the current signal catalog.
//! - **`Configuration`** / **`Figment`**: Semantic and parse errors in the settings.
//! - **`Io`**: Wraps `std::io::Error`, mostly from report persistence.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the crate reports.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The library rejected a call.
    #[error("Transport error {code}: {message}")]
    Transport {
        /// Library result code.
        code: i32,
        /// Text the library resolves for `code`.
        message: String,
    },

    /// A response did not have the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A response arrived for a ticket nobody waits on.
    #[error("No pending request for ticket {0}")]
    Correlation(u32),

    /// A bounded wait ran out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The operation does not apply in the current state.
    #[error("Invalid state: {0}")]
    State(String),

    /// The signal is not part of the current catalog.
    #[error("invalid signal id {0}")]
    InvalidSignalId(u16),

    /// A sample index past the end of a batch.
    #[error("invalid sample number {index} (batch holds {count})")]
    InvalidSampleNumber {
        /// Requested sample.
        index: usize,
        /// Samples in the batch.
        count: usize,
    },

    /// Settings were read but are not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Settings could not be read.
    #[error("Configuration error: {0}")]
    Figment(#[from] figment::Error),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// One or more teardown steps failed; all of them ran.
    #[error("Shutdown failed with errors: {}", join_errors(.0))]
    ShutdownFailed(Vec<DaqError>),
}

fn join_errors(errors: &[DaqError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DaqError {
    /// Build a transport error from a library code and its resolved message.
    pub fn transport(code: i32, message: impl Into<String>) -> Self {
        DaqError::Transport {
            code,
            message: message.into(),
        }
    }

    /// Raised by the library.
    pub fn is_transport(&self) -> bool {
        matches!(self, DaqError::Transport { .. })
    }

    /// A bounded wait ran out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DaqError::Timeout(_))
    }

    /// Library code carried by a transport error.
    pub fn code(&self) -> Option<i32> {
        match self {
            DaqError::Transport { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::transport(-5, "connection lost");
        assert_eq!(err.to_string(), "Transport error -5: connection lost");
        assert_eq!(err.code(), Some(-5));
        assert!(err.is_transport());
    }

    #[test]
    fn test_lookup_errors_name_the_problem() {
        assert!(DaqError::InvalidSignalId(9999)
            .to_string()
            .contains("invalid signal id"));
        let err = DaqError::InvalidSampleNumber { index: 4, count: 4 };
        assert!(err.to_string().contains("invalid sample number"));
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Timeout("close".into()),
            DaqError::State("link closed".into()),
        ]);
        let text = err.to_string();
        assert!(text.contains("Shutdown failed"));
        assert!(text.ends_with("Timed out: close; Invalid state: link closed"));
    }
}
