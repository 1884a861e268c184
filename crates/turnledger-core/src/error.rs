//! Error types for turnledger-core
//!
//! One error hierarchy for the whole library. Task-level failures are
//! classified by [`ErrorKind`] so the orchestrator can decide what to retry.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for turnledger operations
#[derive(Error, Debug)]
pub enum CoreError {
    // ===================
    // Request Errors
    // ===================
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Invalid date range: start {start} is after end {end}")]
    InvalidDateRange { start: String, end: String },

    #[error("Unsupported filter key '{key}' for log type '{log_type}'")]
    UnknownFilterKey { key: String, log_type: String },

    // ===================
    // Upstream Errors
    // ===================
    #[error("Upstream read failed during {operation}: {message}")]
    UpstreamRead { operation: String, message: String },

    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    // ===================
    // Scope Errors
    // ===================
    #[error("Partner not found or has no members: {partner_id}")]
    PartnerNotFound { partner_id: String },

    // ===================
    // Config Errors
    // ===================
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Failed to read config file: {path}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    // ===================
    // Fixture Errors
    // ===================
    #[error("Failed to read fixture: {path}")]
    FixtureRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Coarse classification of a [`CoreError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing request input; never retried
    InvalidRequest,
    /// Datastore timeout or connection loss; retried with backoff
    UpstreamReadFailure,
    /// Partner has zero resolvable members
    PartnerNotFound,
    /// Local configuration or fixture problem
    Config,
}

impl CoreError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn upstream(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamRead {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidRequest { .. }
            | CoreError::InvalidDateRange { .. }
            | CoreError::UnknownFilterKey { .. } => ErrorKind::InvalidRequest,
            CoreError::UpstreamRead { .. } | CoreError::Timeout { .. } => {
                ErrorKind::UpstreamReadFailure
            }
            CoreError::PartnerNotFound { .. } => ErrorKind::PartnerNotFound,
            CoreError::InvalidConfig { .. }
            | CoreError::ConfigRead { .. }
            | CoreError::ConfigParse { .. }
            | CoreError::FixtureRead { .. } => ErrorKind::Config,
        }
    }

    /// Only upstream reads are worth another attempt
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::UpstreamReadFailure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(
            CoreError::invalid_request("missing customer").kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            CoreError::UnknownFilterKey {
                key: "$where".to_string(),
                log_type: "chat".to_string()
            }
            .kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            CoreError::PartnerNotFound {
                partner_id: "p-1".to_string()
            }
            .kind(),
            ErrorKind::PartnerNotFound
        );
    }

    #[test]
    fn test_only_upstream_errors_retry() {
        assert!(CoreError::upstream("find chats", "connection reset").is_retryable());
        assert!(
            CoreError::Timeout {
                operation: "distinct channel".to_string(),
                timeout_ms: 30_000
            }
            .is_retryable()
        );
        assert!(!CoreError::invalid_request("bad range").is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = CoreError::InvalidDateRange {
            start: "2024-02-01".to_string(),
            end: "2024-01-01".to_string(),
        };
        assert!(err.to_string().contains("2024-02-01"));
    }
}
