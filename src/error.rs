//! Custom error types for specflow.
//!
//! Errors fall into two groups. Structural errors (validation, immutability,
//! unknown references, illegal transitions) are rejected synchronously and
//! never enter the state machine. Progress errors (a busy verification lease,
//! failing checks) are retried by the workflow itself and are mirrored in the
//! record's observable state.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for specflow operations
#[derive(Error, Debug)]
pub enum SpecError {
    // =========================================================================
    // Structural Errors
    // =========================================================================
    /// Malformed or inconsistent record data
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Mutation attempted on a completed record
    #[error("Record {id} is immutable: {reason}")]
    ImmutabilityViolation { id: String, reason: String },

    /// Reference to an unknown task, record, or feature
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Transition not permitted from the current state
    #[error("Cannot {action} while {from}")]
    InvalidTransition { from: String, action: String },

    /// Record is parked until a human supplies new input
    #[error("Record {id} is waiting for human input: {reason}")]
    AwaitingInput { id: String, reason: String },

    // =========================================================================
    // Concurrency Errors
    // =========================================================================
    /// Another verifier already holds the lease for this stack
    #[error("Verification lease for stack '{stack}' is busy")]
    ConcurrencyViolation { stack: String },

    /// The stored record changed after this copy was loaded
    #[error("Record {id} changed since it was loaded; reload and retry")]
    StaleRecord { id: String },

    /// Lease released twice, or released against the wrong holder
    #[error("Invalid lease state for stack '{stack}': {reason}")]
    InvalidLeaseState { stack: String, reason: String },

    // =========================================================================
    // Verification Errors
    // =========================================================================
    /// One or more checks failed
    #[error("Verification failed: {}", failed.join(", "))]
    VerificationFailure { failed: Vec<String> },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SpecError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create an invalid-transition error
    pub fn invalid_transition(from: impl ToString, action: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            action: action.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Errors the workflow retries on its own (lease contention, lost
    /// write races, failing checks).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyViolation { .. }
                | Self::StaleRecord { .. }
                | Self::VerificationFailure { .. }
        )
    }

    /// Errors rejected before they can reach the state machine.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::ImmutabilityViolation { .. }
                | Self::NotFound { .. }
                | Self::InvalidTransition { .. }
        )
    }

    /// Check if this error requires human intervention
    pub fn requires_human(&self) -> bool {
        matches!(self, Self::AwaitingInput { .. })
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation { .. } => 2,
            Self::ImmutabilityViolation { .. } => 3,
            Self::NotFound { .. } => 4,
            Self::ConcurrencyViolation { .. } | Self::StaleRecord { .. } => 5,
            Self::VerificationFailure { .. } => 6,
            Self::Config { .. } => 7,
            Self::AwaitingInput { .. } => 8,
            _ => 1,
        }
    }
}

/// Type alias for specflow results
pub type Result<T> = std::result::Result<T, SpecError>;
