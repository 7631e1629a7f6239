//! Error types for the lessonflow engine.
//!
//! Three families are kept apart:
//!
//! - [`PipelineError`]: rejections and failures of engine operations, the
//!   errors callers see.
//! - [`ProviderError`]: failures reported by external collaborators (text
//!   extraction, generation, synthesis). These are classified into
//!   [`RetryClass`] and mostly stay inside the retry executor.
//! - [`RegistryError`]: an invalid step registry.

use crate::core::{StepName, StepStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The step was requested before its predecessor finished.
    #[error("Cannot execute step '{step}': prerequisite step '{prerequisite}' must be completed first (current status: {status})")]
    PrerequisiteNotMet {
        /// The requested step.
        step: StepName,
        /// The predecessor that is not yet satisfied.
        prerequisite: StepName,
        /// The predecessor's current status.
        status: StepStatus,
    },

    /// Another attempt holds the document.
    #[error("Step '{step}' conflicts with an in-flight attempt on step '{in_flight}'")]
    ConcurrentStepConflict {
        /// The requested step.
        step: StepName,
        /// The step currently held by another attempt.
        in_flight: StepName,
    },

    /// The optimistic version check failed.
    #[error("Version conflict for document {document_id}: expected version {expected}, found {actual}")]
    VersionConflict {
        /// The document identifier.
        document_id: String,
        /// The version the writer read.
        expected: u64,
        /// The version currently stored.
        actual: u64,
    },

    /// The failed step has used up its attempts.
    #[error("Maximum retry attempts ({limit}) reached for step '{step}'. Please re-ingest the document.")]
    RetryLimitExceeded {
        /// The failed step.
        step: StepName,
        /// Failures recorded for the step.
        failures: u32,
        /// The configured cap.
        limit: u32,
    },

    /// The step is FAILED and must go through the explicit retry operation.
    #[error("Step '{step}' failed: {cause}")]
    StepFailed {
        /// The failed step.
        step: StepName,
        /// The recorded cause.
        cause: String,
    },

    /// The step was skipped and cannot run.
    #[error("Step '{step}' was skipped")]
    StepSkipped {
        /// The skipped step.
        step: StepName,
    },

    /// The step does not allow skipping.
    #[error("Step '{step}' cannot be skipped")]
    NotSkippable {
        /// The requested step.
        step: StepName,
    },

    /// A retry was requested for a document that is not failed.
    #[error("Document {document_id} is not in a failed state. Nothing to retry.")]
    NotFailed {
        /// The document identifier.
        document_id: String,
    },

    /// A retry named a step other than the failed one.
    #[error("Cannot retry step '{requested}'. The failed step is '{failed}'.")]
    NotTheFailedStep {
        /// The step the caller asked to retry.
        requested: StepName,
        /// The step that actually failed.
        failed: StepName,
    },

    /// The step is not part of the registry.
    #[error("Step '{0}' is not registered in the pipeline")]
    UnknownStep(StepName),

    /// No document with this identifier exists.
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// A document with this identifier already exists.
    #[error("Document already exists: {0}")]
    DocumentExists(String),

    /// Persisted state does not match the registry or is internally inconsistent.
    #[error("Corrupt document state: {0}")]
    CorruptState(String),

    /// The attempt was cancelled between retries.
    #[error("Step '{step}' cancelled: {reason}")]
    Cancelled {
        /// The step whose attempt was cancelled.
        step: StepName,
        /// The cancellation reason.
        reason: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store backend failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl PipelineError {
    /// Returns true if the caller should reload state and try again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentStepConflict { .. } | Self::VersionConflict { .. }
        )
    }

    /// Returns the stable error code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PrerequisiteNotMet { .. } => "PrerequisiteNotMet",
            Self::ConcurrentStepConflict { .. } => "ConcurrentStepConflict",
            Self::VersionConflict { .. } => "VersionConflict",
            Self::RetryLimitExceeded { .. } => "RetryLimitExceeded",
            Self::StepFailed { .. } => "StepFailed",
            Self::StepSkipped { .. } => "StepSkipped",
            Self::NotSkippable { .. } => "NotSkippable",
            Self::NotFailed { .. } => "NotFailed",
            Self::NotTheFailedStep { .. } => "NotTheFailedStep",
            Self::UnknownStep(_) => "UnknownStep",
            Self::DocumentNotFound(_) => "DocumentNotFound",
            Self::DocumentExists(_) => "DocumentExists",
            Self::CorruptState(_) => "CorruptState",
            Self::Cancelled { .. } => "Cancelled",
            Self::Config(_) => "Config",
            Self::Store(_) => "Store",
            Self::Serialization(_) => "Serialization",
            Self::Io(_) => "Io",
        }
    }

    /// Returns the step this error concerns, if any.
    #[must_use]
    pub fn step(&self) -> Option<StepName> {
        match self {
            Self::PrerequisiteNotMet { step, .. }
            | Self::ConcurrentStepConflict { step, .. }
            | Self::RetryLimitExceeded { step, .. }
            | Self::StepFailed { step, .. }
            | Self::StepSkipped { step }
            | Self::NotSkippable { step }
            | Self::Cancelled { step, .. } => Some(*step),
            Self::NotTheFailedStep { requested, .. } => Some(*requested),
            Self::UnknownStep(step) => Some(*step),
            _ => None,
        }
    }

    /// Converts to a dictionary representation for caller-facing responses.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.code()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("transient".to_string(), serde_json::json!(self.is_transient()));
        if let Some(step) = self.step() {
            map.insert("step".to_string(), serde_json::json!(step.as_str()));
        }
        map
    }
}

/// Whether a failed attempt may be repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    /// Transient: timeouts, rate limiting, transient I/O.
    Retriable,
    /// Permanent: malformed input or output, validation failures.
    Fatal,
}

/// Errors reported by external collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum ProviderError {
    /// The upstream provider did not answer in time.
    #[error("Provider timed out: {0}")]
    ProviderTimeout(String),

    /// The upstream provider rejected the call due to rate limiting.
    #[error("Provider rate limited: {0}")]
    ProviderRateLimited(String),

    /// The provider answered with output that does not fit the contract.
    #[error("Provider returned malformed output: {0}")]
    ProviderMalformed(String),

    /// No usable content was recovered.
    #[error("Empty content: {0}")]
    EmptyContent(String),

    /// The input format is not supported.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A transient I/O failure talking to a collaborator.
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),
}

impl ProviderError {
    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::ProviderTimeout(detail.into())
    }

    /// Creates a rate-limited error.
    #[must_use]
    pub fn rate_limited(detail: impl Into<String>) -> Self {
        Self::ProviderRateLimited(detail.into())
    }

    /// Creates a malformed-output error.
    #[must_use]
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::ProviderMalformed(detail.into())
    }

    /// Creates an empty-content error.
    #[must_use]
    pub fn empty(detail: impl Into<String>) -> Self {
        Self::EmptyContent(detail.into())
    }

    /// Classifies the error for the retry executor.
    #[must_use]
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::ProviderTimeout(_) | Self::ProviderRateLimited(_) | Self::TransientIo(_) => {
                RetryClass::Retriable
            }
            Self::ProviderMalformed(_) | Self::EmptyContent(_) | Self::UnsupportedFormat(_) => {
                RetryClass::Fatal
            }
        }
    }

    /// Returns true if the error is worth retrying.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.retry_class() == RetryClass::Retriable
    }
}

/// Errors raised while building a step registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry has no steps.
    #[error("A pipeline needs at least one step")]
    Empty,

    /// A step was declared twice.
    #[error("Step '{0}' is declared more than once")]
    DuplicateStep(StepName),

    /// A step names a predecessor other than the entry before it.
    #[error("Step '{step}' must follow '{expected:?}', but declares '{declared:?}'")]
    BrokenChain {
        /// The offending step.
        step: StepName,
        /// The predecessor implied by position.
        expected: Option<StepName>,
        /// The predecessor the step declared.
        declared: Option<StepName>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        assert_eq!(ProviderError::timeout("60s").retry_class(), RetryClass::Retriable);
        assert_eq!(ProviderError::rate_limited("429").retry_class(), RetryClass::Retriable);
        assert_eq!(
            ProviderError::TransientIo("reset".into()).retry_class(),
            RetryClass::Retriable
        );
        assert_eq!(ProviderError::malformed("bad json").retry_class(), RetryClass::Fatal);
        assert_eq!(ProviderError::empty("no text").retry_class(), RetryClass::Fatal);
        assert_eq!(
            ProviderError::UnsupportedFormat("xls".into()).retry_class(),
            RetryClass::Fatal
        );
    }

    #[test]
    fn test_prerequisite_message_names_both_steps() {
        let err = PipelineError::PrerequisiteNotMet {
            step: StepName::GenerateLesson,
            prerequisite: StepName::ExtractThemes,
            status: StepStatus::Pending,
        };

        let message = err.to_string();
        assert!(message.contains("GENERATE_LESSON"));
        assert!(message.contains("EXTRACT_THEMES"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_conflicts_are_transient() {
        let conflict = PipelineError::ConcurrentStepConflict {
            step: StepName::ExtractText,
            in_flight: StepName::ExtractText,
        };
        let version = PipelineError::VersionConflict {
            document_id: "doc".into(),
            expected: 1,
            actual: 2,
        };

        assert!(conflict.is_transient());
        assert!(version.is_transient());
    }

    #[test]
    fn test_to_dict_includes_step_and_code() {
        let err = PipelineError::RetryLimitExceeded {
            step: StepName::ExtractThemes,
            failures: 3,
            limit: 3,
        };
        let dict = err.to_dict();

        assert_eq!(dict.get("type").unwrap(), "RetryLimitExceeded");
        assert_eq!(dict.get("step").unwrap(), "EXTRACT_THEMES");
        assert_eq!(dict.get("transient").unwrap(), false);
    }

    #[test]
    fn test_provider_error_serialization() {
        let err = ProviderError::rate_limited("slow down");
        let json = serde_json::to_string(&err).unwrap();
        let back: ProviderError = serde_json::from_str(&json).unwrap();

        assert_eq!(err, back);
    }
}
