//! Error taxonomy shared by every subsystem.
//!
//! Library code returns [`Error`] (or one of the per-subsystem enums that
//! convert into it). The CLI wraps these in `anyhow` and maps them to process
//! exit codes with [`Error::exit_code`].
//!
//! | Variant | Surfaced when | Retried locally |
//! |---------|---------------|-----------------|
//! | [`Error::InvalidInput`] | argument violates a precondition | never |
//! | [`Error::NotFound`] | entity id absent | never |
//! | [`Error::Provider`] | LLM endpoint failure | pool retries retryable kinds |
//! | [`Error::Tool`] | tool server failure | executor applies the step policy |
//! | [`Error::Index`] | dimension mismatch, storage failure | never |
//! | [`Error::Cancelled`] | caller cancelled | never |

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Index(#[from] IndexError),

    /// The planner produced something the executor cannot admit or run.
    #[error("plan error: {0}")]
    Plan(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Process exit code for the `ctxa` binary.
    ///
    /// `2` (configuration error) is assigned by the CLI itself because
    /// configuration loading happens before any library call.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Provider(_) => 3,
            Error::Tool(_) => 4,
            _ => 1,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Index(IndexError::Storage(e))
    }
}

/// Failures of an LLM or embedding endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider '{provider}' unavailable: {message}")]
    Unavailable { provider: String, message: String },

    #[error("provider '{provider}' overloaded: {message}")]
    Overloaded { provider: String, message: String },

    #[error("provider '{provider}' rejected the request: {message}")]
    InvalidRequest { provider: String, message: String },

    #[error("provider '{provider}' timed out after {elapsed:?}")]
    Timeout { provider: String, elapsed: Duration },

    #[error("no provider available before the deadline")]
    NoProviderAvailable,

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl ProviderError {
    /// Whether the pool may retry this failure on a different entry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable { .. }
                | ProviderError::Overloaded { .. }
                | ProviderError::Timeout { .. }
        )
    }

    /// Whether this failure counts against the entry's health.
    ///
    /// Invalid requests are the caller's fault and leave health untouched.
    pub fn counts_as_failure(&self) -> bool {
        self.is_retryable()
    }
}

/// Failures of a tool invocation through the broker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("tool server '{server}' unavailable")]
    ServerUnavailable { server: String },

    #[error("invalid arguments for '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("tool '{tool}' timed out")]
    Timeout { tool: String },

    #[error("tool execution failed ({code}): {message}")]
    ExecutionFailed { code: i64, message: String },

    #[error("tool call cancelled")]
    Cancelled,
}

/// Failures of the hybrid index and its backing database.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("vector dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("corrupt index data: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::from(ProviderError::NoProviderAvailable).exit_code(), 3);
        assert_eq!(
            Error::from(ToolError::ServerUnavailable {
                server: "fs".into()
            })
            .exit_code(),
            4
        );
        assert_eq!(Error::NotFound("doc".into()).exit_code(), 1);
        assert_eq!(Error::Cancelled.exit_code(), 1);
    }

    #[test]
    fn test_retryable_kinds() {
        let p = || "p".to_string();
        assert!(ProviderError::Unavailable {
            provider: p(),
            message: String::new()
        }
        .is_retryable());
        assert!(ProviderError::Overloaded {
            provider: p(),
            message: String::new()
        }
        .is_retryable());
        assert!(ProviderError::Timeout {
            provider: p(),
            elapsed: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!ProviderError::InvalidRequest {
            provider: p(),
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::NoProviderAvailable.is_retryable());
    }
}
