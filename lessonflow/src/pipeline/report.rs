//! Results returned to callers of the engine.

use crate::core::{
    Document, DocumentId, DocumentStatus, IngestionId, StepName, StepOutput, StepStatus,
    StepStatusMap,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the engine handled a step request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// The operation ran and its outcome was recorded.
    Executed,
    /// Same key as the completing request; the stored result was returned.
    Replayed,
    /// Completed under another key; the stored result was returned.
    AlreadyCompleted,
    /// The same key currently holds the step; nothing was run.
    InFlight,
    /// The step is skipped.
    Skipped,
}

impl Disposition {
    /// Returns true if the operation was invoked for this request.
    #[must_use]
    pub fn invoked_operation(&self) -> bool {
        matches!(self, Self::Executed)
    }
}

/// The failing step and its cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    /// The failed step.
    pub step: StepName,
    /// Human-readable cause.
    pub cause: String,
}

/// Outcome of a step request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// The document.
    pub document_id: DocumentId,
    /// External join key of the document.
    pub ingestion_id: IngestionId,
    /// The requested step.
    pub step: StepName,
    /// Status of the step after the request.
    pub status: StepStatus,
    /// Derived document status after the request.
    pub document_status: DocumentStatus,
    /// How the request was handled.
    pub disposition: Disposition,
    /// The stored output, when the step is completed.
    pub output: Option<StepOutput>,
    /// The first step that is neither completed nor skipped.
    pub next_step: Option<StepName>,
    /// Failed attempts over the document's lifetime.
    pub retry_count: u32,
    /// Operation attempts made by this request.
    pub attempts: u32,
    /// Set when the step failed.
    pub failure: Option<StepFailure>,
}

impl StepReport {
    pub(crate) fn from_document(
        document: &Document,
        step: StepName,
        disposition: Disposition,
        attempts: u32,
    ) -> Self {
        let status = document.step_status(step).unwrap_or_default();
        let failure = (status == StepStatus::Failed).then(|| StepFailure {
            step,
            cause: document
                .record(step)
                .and_then(|record| record.last_error.clone())
                .or_else(|| document.step_error_message.clone())
                .unwrap_or_default(),
        });

        Self {
            document_id: document.id,
            ingestion_id: document.ingestion_id.clone(),
            step,
            status,
            document_status: document.status(),
            disposition,
            output: document.output(step).cloned(),
            next_step: next_expected_step(document),
            retry_count: document.retry_count,
            attempts,
            failure,
        }
    }

    /// Returns true if the step is completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// Returns true if this request recorded a failure.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Converts to a JSON value for caller-facing responses.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// The first step in pipeline order that is neither completed nor skipped.
#[must_use]
pub fn next_expected_step(document: &Document) -> Option<StepName> {
    document
        .step_statuses
        .iter()
        .find(|(_, status)| !status.satisfies_prerequisite())
        .map(|(step, _)| step)
}

/// Processing progress of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    /// The document.
    pub document_id: DocumentId,
    /// External join key of the document.
    pub ingestion_id: IngestionId,
    /// Derived document status.
    pub status: DocumentStatus,
    /// The step in flight or last attempted.
    pub current_step: Option<StepName>,
    /// Per-step status in pipeline order.
    pub step_statuses: StepStatusMap,
    /// Completed or skipped steps as a percentage.
    pub progress_percentage: u8,
    /// The failed step, while failed.
    pub failed_step: Option<StepName>,
    /// The failure cause, while failed.
    pub error_message: Option<String>,
    /// Failed attempts over the document's lifetime.
    pub retry_count: u32,
    /// Whether the failed step may still be retried.
    pub can_retry: bool,
    /// The first step that is neither completed nor skipped.
    pub next_step: Option<StepName>,
    /// When every step finished.
    pub processed_at: Option<DateTime<Utc>>,
}

impl ProcessingStatus {
    pub(crate) fn from_document(document: &Document, max_step_failures: u32) -> Self {
        Self {
            document_id: document.id,
            ingestion_id: document.ingestion_id.clone(),
            status: document.status(),
            current_step: document.current_step,
            step_statuses: document.step_statuses.clone(),
            progress_percentage: document.progress_percentage(),
            failed_step: document.failed_step,
            error_message: document.step_error_message.clone(),
            retry_count: document.retry_count,
            can_retry: document.can_retry(max_step_failures),
            next_step: next_expected_step(document),
            processed_at: document.processed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExtractedText, FileRef, FileType};

    fn document() -> Document {
        Document::new("Doc", FileRef::new("doc.txt", FileType::Txt), StepName::ALL)
    }

    #[test]
    fn test_next_expected_step() {
        let mut doc = document();
        assert_eq!(next_expected_step(&doc), Some(StepName::ExtractText));

        doc.step_statuses
            .transition(StepName::ExtractText, StepStatus::InProgress)
            .unwrap();
        doc.step_statuses
            .transition(StepName::ExtractText, StepStatus::Completed)
            .unwrap();

        assert_eq!(next_expected_step(&doc), Some(StepName::ExtractThemes));
    }

    #[test]
    fn test_report_carries_output_and_failure() {
        let mut doc = document();
        doc.step_statuses
            .transition(StepName::ExtractText, StepStatus::InProgress)
            .unwrap();
        doc.step_statuses
            .transition(StepName::ExtractText, StepStatus::Completed)
            .unwrap();
        doc.record_mut(StepName::ExtractText).output =
            Some(StepOutput::Text(ExtractedText::counted("a b c")));
        doc.step_statuses
            .transition(StepName::ExtractThemes, StepStatus::InProgress)
            .unwrap();
        doc.step_statuses
            .transition(StepName::ExtractThemes, StepStatus::Failed)
            .unwrap();
        doc.record_mut(StepName::ExtractThemes).last_error = Some("timed out".into());

        let done = StepReport::from_document(&doc, StepName::ExtractText, Disposition::Replayed, 0);
        assert!(done.is_completed());
        assert!(done.output.is_some());
        assert!(!done.disposition.invoked_operation());

        let failed =
            StepReport::from_document(&doc, StepName::ExtractThemes, Disposition::Executed, 4);
        assert_eq!(
            failed.failure,
            Some(StepFailure {
                step: StepName::ExtractThemes,
                cause: "timed out".into()
            })
        );
        assert_eq!(failed.document_status, DocumentStatus::Failed);
        assert_eq!(failed.to_dict()["failure"]["step"], "EXTRACT_THEMES");
    }
}
