//! Error types for the Halldyll provisioning engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph construction, state management, planning, provider
//! calls, and plan execution.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Halldyll provisioning engine.
#[derive(Debug, Error)]
pub enum HalldyllError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Execution errors.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Resource graph construction errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {cycle}")]
    Cycle {
        /// The cycle path, e.g. `a.x -> a.y -> a.x`.
        cycle: String,
    },

    /// Two declarations share a logical identity.
    #[error("Duplicate resource identity: {identity}")]
    DuplicateIdentity {
        /// The duplicated identity.
        identity: String,
    },

    /// A reference or explicit dependency names an undeclared resource.
    #[error("Resource '{from}' references undeclared resource '{to}'")]
    UnknownReference {
        /// The referencing resource.
        from: String,
        /// The missing target.
        to: String,
    },

    /// A logical identity could not be parsed.
    #[error("Invalid resource identity '{value}': {reason}")]
    InvalidIdentity {
        /// The offending text.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Local filesystem error while reading or writing state.
    #[error("State file error: {message}")]
    Io {
        /// Description of the filesystem error.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: supported up to {expected}, found {found}")]
    VersionMismatch {
        /// Newest supported state version.
        expected: u32,
        /// Found state version.
        found: u64,
    },
}

/// Errors reported by a provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// A failure that may succeed on retry.
    #[error("transient provider failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// Provider-suggested delay before retrying.
        retry_after_secs: Option<u64>,
    },

    /// A failure that will not succeed on retry.
    #[error("permanent provider failure: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Step dependencies could not be ordered.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },

    /// The approved plan no longer matches the stack or its state.
    #[error("Plan is stale: {message}")]
    Stale {
        /// What changed since the plan was approved.
        message: String,
    },
}

/// Errors attached to individual plan steps.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// A dependency of this step did not apply.
    #[error("Skipped: dependency '{dependency}' did not apply")]
    DependencyFailed {
        /// The dependency that failed or was skipped.
        dependency: String,
    },

    /// A reference could not be resolved from applied outputs.
    #[error("Unresolved reference {target}.{output}")]
    UnresolvedReference {
        /// Referenced resource.
        target: String,
        /// Referenced output.
        output: String,
    },

    /// An update was planned but no provider identity is recorded.
    #[error("No provider identity recorded for '{resource}'")]
    MissingProviderId {
        /// The resource without a provider identity.
        resource: String,
    },

    /// The step task panicked or was aborted.
    #[error("Step task failed: {message}")]
    TaskFailed {
        /// Description of the task failure.
        message: String,
    },

    /// The run was cancelled before the step started.
    #[error("Cancelled before start")]
    Cancelled,
}

/// Result type alias for Halldyll operations.
pub type Result<T> = std::result::Result<T, HalldyllError>;

impl HalldyllError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Transient { .. })
                | Self::State(StateError::LockFailed { .. })
        )
    }

    /// Returns true if this error must abort a run before any provider call.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Graph(_)
                | Self::Config(_)
                | Self::State(StateError::Corrupted { .. } | StateError::VersionMismatch { .. })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a filesystem error with the given message.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient error without a retry hint.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after_secs: None,
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Returns true if the failure may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the provider-suggested retry delay in seconds, if any.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Transient {
                retry_after_secs, ..
            } => *retry_after_secs,
            Self::Permanent { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_errors_abort() {
        let cycle = HalldyllError::Graph(GraphError::Cycle {
            cycle: String::from("a.x -> a.x"),
        });
        assert!(cycle.is_structural());

        let corrupt = HalldyllError::State(StateError::corrupted("bad json"));
        assert!(corrupt.is_structural());

        let provider = HalldyllError::Provider(ProviderError::permanent("denied"));
        assert!(!provider.is_structural());
    }

    #[test]
    fn test_transient_is_retryable() {
        let err = HalldyllError::Provider(ProviderError::Transient {
            message: String::from("throttled"),
            retry_after_secs: Some(3),
        });
        assert!(err.is_retryable());

        let HalldyllError::Provider(inner) = err else {
            unreachable!();
        };
        assert_eq!(inner.retry_after_secs(), Some(3));
        assert!(!ProviderError::permanent("nope").is_transient());
    }
}
