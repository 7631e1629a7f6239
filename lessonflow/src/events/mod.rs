//! Pipeline events for observability.
//!
//! The engine describes every transition as a [`PipelineEvent`] and hands it
//! to an [`EventSink`]. Sinks receive the event type string and a JSON
//! payload, so they stay independent of the event enum.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::{DocumentId, StepName};
use serde::Serialize;

/// A structured pipeline event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PipelineEvent {
    /// A document was created.
    DocumentCreated {
        /// The new document.
        document_id: DocumentId,
        /// Its ingestion id.
        ingestion_id: String,
    },
    /// A document was replaced by a fresh identity.
    DocumentReingested {
        /// The new document.
        document_id: DocumentId,
        /// The deleted document.
        previous_document_id: DocumentId,
    },
    /// A document and its artifacts were deleted.
    DocumentDeleted {
        /// The deleted document.
        document_id: DocumentId,
    },
    /// A step was claimed and its operation is about to run.
    StepStarted {
        /// The document.
        document_id: DocumentId,
        /// The claimed step.
        step: StepName,
        /// Key supplied by the caller.
        idempotency_key: String,
        /// True when the claim retries a failed step.
        retry: bool,
    },
    /// A failed attempt will be repeated after a delay.
    StepRetryScheduled {
        /// The document.
        document_id: DocumentId,
        /// The running step.
        step: StepName,
        /// The attempt that failed.
        attempt: u32,
        /// Backoff before the next attempt.
        delay_ms: u64,
        /// The attempt's error.
        error: String,
    },
    /// A step completed and its output was stored.
    StepCompleted {
        /// The document.
        document_id: DocumentId,
        /// The completed step.
        step: StepName,
        /// Attempts the operation needed.
        attempts: u32,
        /// Wall time of the operation.
        duration_ms: u64,
        /// The step that may run next.
        next_step: Option<StepName>,
    },
    /// A step was recorded as failed.
    StepFailed {
        /// The document.
        document_id: DocumentId,
        /// The failed step.
        step: StepName,
        /// Human-readable cause.
        cause: String,
        /// Attempts the operation used.
        attempts: u32,
        /// Document retry count after the failure.
        retry_count: u32,
    },
    /// A request was answered from the stored result.
    StepReplayed {
        /// The document.
        document_id: DocumentId,
        /// The requested step.
        step: StepName,
        /// Key supplied by the caller.
        idempotency_key: String,
    },
    /// A step was skipped.
    StepSkipped {
        /// The document.
        document_id: DocumentId,
        /// The skipped step.
        step: StepName,
        /// Caller-supplied reason.
        reason: String,
    },
    /// A citation could not be found in the source text.
    CitationUnverified {
        /// The document.
        document_id: DocumentId,
        /// Rank of the citation in its batch.
        order: usize,
        /// The snippet.
        snippet: String,
        /// Fraction of snippet words found in order.
        ratio: f64,
    },
}

impl PipelineEvent {
    /// Returns the dotted event type.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::DocumentCreated { .. } => "document.created",
            Self::DocumentReingested { .. } => "document.reingested",
            Self::DocumentDeleted { .. } => "document.deleted",
            Self::StepStarted { .. } => "step.started",
            Self::StepRetryScheduled { .. } => "step.retry_scheduled",
            Self::StepCompleted { .. } => "step.completed",
            Self::StepFailed { .. } => "step.failed",
            Self::StepReplayed { .. } => "step.replayed",
            Self::StepSkipped { .. } => "step.skipped",
            Self::CitationUnverified { .. } => "citation.unverified",
        }
    }

    /// Returns the event payload as JSON.
    #[must_use]
    pub fn to_data(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
