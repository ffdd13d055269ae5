//! Error types for Gauntlet Core
//!
//! Errors are split by how far they are allowed to travel:
//! - [`StepError`] stays inside a run and is routed to the behavior's `on_error`
//! - [`SetupError`] aborts a single run before its first step
//! - [`OrchestrationError`] rejects a job before any replication starts
//! - [`ConfigError`] covers job files on disk

use crate::types::ExecutionMode;

/// Errors raised by transport implementations
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Session could not be created
    #[error("session construction failed: {0}")]
    Construction(String),

    /// Connection or I/O failure
    #[error("transport I/O failed: {0}")]
    Io(String),

    /// Transport-level timeout
    #[error("transport timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Interactive element could not be located
    #[error("element not found: {0}")]
    ElementNotFound(String),

    /// Session was already closed
    #[error("session closed")]
    Closed,
}

/// Transient failure of a single step
///
/// Never escapes a run: the executor hands it to `Behavior::on_error`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    /// Transport call failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Request was rejected after the single CSRF refresh and retry
    #[error("authorization failed with status {status} after token refresh")]
    Authorization { status: u16 },

    /// Procedure could not evaluate the outcome
    #[error("verification failed: {0}")]
    Verification(String),

    /// Procedure-specific failure
    #[error("step failed: {0}")]
    Procedure(String),
}

impl StepError {
    /// Check if this is a surfaced protocol failure
    #[inline]
    #[must_use]
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Authorization { .. })
    }

    /// Create a procedure failure
    #[inline]
    pub fn procedure(message: impl Into<String>) -> Self {
        Self::Procedure(message.into())
    }
}

/// Authentication collaborator errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// Credentials were rejected
    #[error("authentication rejected by {mechanism}")]
    Rejected { mechanism: String },

    /// Mechanism failed to talk to the target
    #[error("authentication transport error: {0}")]
    Transport(#[from] TransportError),

    /// Mechanism is misconfigured
    #[error("invalid authentication configuration: {0}")]
    Invalid(String),
}

/// Fatal setup failure; the run is aborted and marked FAIL
#[derive(Debug, Clone, thiserror::Error)]
pub enum SetupError {
    /// Transport factory could not construct the session
    #[error("transport construction failed: {0}")]
    Transport(#[from] TransportError),

    /// Authentication failed before the first step
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),

    /// Pre-seeded context disagrees with the procedure
    #[error("context mode {context:?} does not match procedure mode {procedure:?}")]
    ModeMismatch {
        context: ExecutionMode,
        procedure: ExecutionMode,
    },
}

/// Job configuration rejected before orchestration starts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestrationError {
    /// Replication count of zero
    #[error("replication count must be at least 1")]
    NoReplications,

    /// Worker pool of size zero
    #[error("concurrency limit must be at least 1")]
    ZeroConcurrency,

    /// Batch size of zero
    #[error("batch size must be at least 1")]
    ZeroBatchSize,

    /// Threshold outside [0, 1]
    #[error("batch failure threshold {0} is outside [0, 1]")]
    InvalidThreshold(String),

    /// Distributed strategy with nothing to distribute
    #[error("distributed strategy requires at least one proxy or credential")]
    EmptyPools,
}

/// Job file errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// TOML parse failure
    #[error("invalid TOML job file: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parse failure
    #[error("invalid JSON job file: {0}")]
    Json(#[from] serde_json::Error),

    /// Field outside its allowed range
    #[error("invalid value for {field}: {reason}")]
    Field { field: &'static str, reason: String },

    /// Parsed but semantically invalid
    #[error("invalid job: {0}")]
    Invalid(#[from] OrchestrationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_display() {
        let err = StepError::Authorization { status: 419 };
        assert!(err.to_string().contains("419"));
        assert!(err.is_authorization());
    }

    #[test]
    fn transport_error_converts_into_step_and_setup() {
        let step: StepError = TransportError::Io("reset".to_string()).into();
        assert!(!step.is_authorization());
        assert!(step.to_string().contains("reset"));

        let setup: SetupError = TransportError::Construction("no driver".to_string()).into();
        assert!(setup.to_string().contains("no driver"));
    }

    #[test]
    fn orchestration_error_display() {
        assert!(OrchestrationError::EmptyPools
            .to_string()
            .contains("proxy or credential"));
    }
}
