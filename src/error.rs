//! Error types for Conversar
//!
//! One crate-wide error enum covering every failure surface: argument
//! validation, missing model files, internal invariant violations, tensor
//! runtime failures, cooperative cancellation, and tool execution.

use thiserror::Error;

/// Result type alias for Conversar operations
pub type Result<T> = std::result::Result<T, ConversarError>;

/// Error type for all Conversar operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversarError {
    /// Caller-supplied input was rejected (empty text, oversized input,
    /// malformed configuration, shape mismatch)
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Why the argument was rejected
        reason: String,
    },

    /// A model or tokenizer file could not be located
    #[error("Not found: {path}")]
    NotFound {
        /// The path that failed to resolve
        path: String,
    },

    /// An internal invariant was broken. The owning session is poisoned and
    /// must be disposed.
    #[error("Invariant violation: {reason}")]
    InvariantViolation {
        /// Which invariant failed
        reason: String,
    },

    /// The tensor-graph runtime reported an error. The original message is
    /// preserved verbatim.
    #[error("Runtime failure: {message}")]
    RuntimeFailure {
        /// The runtime's error message
        message: String,
    },

    /// The operation was cancelled cooperatively before dispatch
    #[error("Operation cancelled")]
    Cancelled,

    /// A tool executor failed. Recovered locally by the orchestrator: the
    /// failure is fed back into generation as an error-marked tool result.
    #[error("Tool failure: {message}")]
    ToolFailure {
        /// The executor's error message
        message: String,
    },
}

impl ConversarError {
    /// Shorthand for an [`ConversarError::InvalidArgument`] error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`ConversarError::InvariantViolation`] error
    pub fn invariant(reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`ConversarError::RuntimeFailure`] error
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::RuntimeFailure {
            message: message.into(),
        }
    }
}
