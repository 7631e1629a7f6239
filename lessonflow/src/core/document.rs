//! The document aggregate and its per-step state.

use super::{DocumentStatus, OutputKind, StepName, StepOutput, StepStatus};
use crate::errors::PipelineError;
use chrono::{DateTime, Duration, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Primary key of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    /// Generates a new random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// External join key for every artifact derived from a document.
///
/// Assigned once at creation and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IngestionId(String);

impl IngestionId {
    /// Generates a new identifier of the form `ing_<12 hex chars>`.
    #[must_use]
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("ing_{}", &hex[..12]))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IngestionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declared type of the uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileType {
    /// Portable document format.
    Pdf,
    /// Word document.
    Docx,
    /// Plain text.
    Txt,
}

impl FileType {
    /// Maps a file extension to a file type.
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" => Some(Self::Txt),
            _ => None,
        }
    }
}

/// Opaque pointer to the uploaded file, resolved by the text extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Storage location understood by the extractor.
    pub location: String,
    /// Declared file type.
    pub file_type: FileType,
}

impl FileRef {
    /// Creates a file reference.
    #[must_use]
    pub fn new(location: impl Into<String>, file_type: FileType) -> Self {
        Self {
            location: location.into(),
            file_type,
        }
    }
}

/// Step statuses in pipeline order.
///
/// Serialized as a JSON object whose key order is the pipeline order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepStatusMap {
    entries: Vec<(StepName, StepStatus)>,
}

impl StepStatusMap {
    /// Creates a map with every step pending.
    pub fn pending<I>(steps: I) -> Self
    where
        I: IntoIterator<Item = StepName>,
    {
        Self {
            entries: steps
                .into_iter()
                .map(|step| (step, StepStatus::Pending))
                .collect(),
        }
    }

    /// Returns the status of a step.
    #[must_use]
    pub fn get(&self, step: StepName) -> Option<StepStatus> {
        self.entries
            .iter()
            .find(|(name, _)| *name == step)
            .map(|(_, status)| *status)
    }

    /// Moves a step to a new status, rejecting illegal transitions.
    pub fn transition(&mut self, step: StepName, next: StepStatus) -> Result<(), PipelineError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|(name, _)| *name == step)
            .ok_or_else(|| PipelineError::CorruptState(format!("step '{step}' missing from status map")))?;

        if !entry.1.can_transition_to(next) {
            return Err(PipelineError::CorruptState(format!(
                "illegal transition for step '{step}': {} -> {next}",
                entry.1
            )));
        }
        entry.1 = next;
        Ok(())
    }

    /// Iterates over steps and statuses in pipeline order.
    pub fn iter(&self) -> impl Iterator<Item = (StepName, StepStatus)> + '_ {
        self.entries.iter().copied()
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counts steps with the given status.
    #[must_use]
    pub fn count(&self, status: StepStatus) -> usize {
        self.entries.iter().filter(|(_, s)| *s == status).count()
    }

    /// Returns the steps currently in progress.
    #[must_use]
    pub fn in_progress(&self) -> Vec<StepName> {
        self.entries
            .iter()
            .filter(|(_, s)| *s == StepStatus::InProgress)
            .map(|(step, _)| *step)
            .collect()
    }

    /// Checks that the map lists exactly `order`, in that order.
    pub fn validate_order(&self, order: &[StepName]) -> Result<(), PipelineError> {
        let steps: Vec<StepName> = self.entries.iter().map(|(step, _)| *step).collect();
        if steps != order {
            return Err(PipelineError::CorruptState(format!(
                "step statuses {steps:?} do not match pipeline {order:?}"
            )));
        }
        if self.in_progress().len() > 1 {
            return Err(PipelineError::CorruptState(
                "more than one step in progress".to_string(),
            ));
        }
        Ok(())
    }
}

impl Serialize for StepStatusMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (step, status) in &self.entries {
            map.serialize_entry(step, status)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StepStatusMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = StepStatusMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of step names to step statuses")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((step, status)) = access.next_entry::<StepName, StepStatus>()? {
                    if entries.iter().any(|(seen, _)| *seen == step) {
                        return Err(serde::de::Error::custom(format!("duplicate step '{step}'")));
                    }
                    entries.push((step, status));
                }
                Ok(StepStatusMap { entries })
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// Per-step bookkeeping: the stored result and failure history.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepRecord {
    /// Key of the attempt that completed the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// The stored output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutput>,
    /// When the step completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Executor attempts used by the last run.
    #[serde(default)]
    pub attempts: u32,
    /// Failed runs of this step.
    #[serde(default)]
    pub failure_count: u32,
    /// Cause of the last failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Why the step was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

/// The claim an attempt holds while its step is in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightClaim {
    /// The claimed step.
    pub step: StepName,
    /// Key supplied by the claiming caller.
    pub idempotency_key: String,
    /// Distinguishes attempts that share a key.
    pub attempt_id: Uuid,
    /// When the claim was taken.
    pub started_at: DateTime<Utc>,
}

impl InFlightClaim {
    /// Returns true if the claim is older than `stale_after`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now - self.started_at >= stale_after
    }
}

/// The aggregate root of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Primary key.
    pub id: DocumentId,
    /// Immutable external join key.
    pub ingestion_id: IngestionId,
    /// Display title.
    pub title: String,
    /// The uploaded file.
    pub file_ref: FileRef,
    /// The step in flight or last attempted.
    pub current_step: Option<StepName>,
    /// Per-step status in pipeline order.
    pub step_statuses: StepStatusMap,
    /// Set only while the document is failed.
    pub failed_step: Option<StepName>,
    /// Set only while the document is failed.
    pub step_error_message: Option<String>,
    /// Failed attempts over the document's lifetime.
    pub retry_count: u32,
    /// Last key supplied for the step in flight or last completed.
    pub idempotency_key: Option<String>,
    /// Stored results and failure history.
    #[serde(default)]
    pub step_records: BTreeMap<StepName, StepRecord>,
    /// The active claim, if a step is in progress.
    #[serde(default)]
    pub in_flight: Option<InFlightClaim>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// When every step finished.
    pub processed_at: Option<DateTime<Utc>>,
}

impl Document {
    /// Creates a new document with every step pending.
    pub fn new<I>(title: impl Into<String>, file_ref: FileRef, steps: I) -> Self
    where
        I: IntoIterator<Item = StepName>,
    {
        let now = Utc::now();
        Self {
            id: DocumentId::new(),
            ingestion_id: IngestionId::generate(),
            title: title.into(),
            file_ref,
            current_step: None,
            step_statuses: StepStatusMap::pending(steps),
            failed_step: None,
            step_error_message: None,
            retry_count: 0,
            idempotency_key: None,
            step_records: BTreeMap::new(),
            in_flight: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    /// Overall status, derived from the step statuses.
    #[must_use]
    pub fn status(&self) -> DocumentStatus {
        DocumentStatus::derive(self.step_statuses.iter().map(|(_, status)| status))
    }

    /// Returns the status of a step.
    pub fn step_status(&self, step: StepName) -> Result<StepStatus, PipelineError> {
        self.step_statuses.get(step).ok_or_else(|| {
            PipelineError::CorruptState(format!("document {} has no status for step '{step}'", self.id))
        })
    }

    /// Returns the record of a step, if any.
    #[must_use]
    pub fn record(&self, step: StepName) -> Option<&StepRecord> {
        self.step_records.get(&step)
    }

    /// Returns the record of a step, creating it if needed.
    pub fn record_mut(&mut self, step: StepName) -> &mut StepRecord {
        self.step_records.entry(step).or_default()
    }

    /// Returns the stored output of a step.
    #[must_use]
    pub fn output(&self, step: StepName) -> Option<&StepOutput> {
        self.record(step).and_then(|record| record.output.as_ref())
    }

    /// Returns the first stored output of the given kind.
    #[must_use]
    pub fn output_of_kind(&self, kind: OutputKind) -> Option<&StepOutput> {
        self.step_records
            .values()
            .filter_map(|record| record.output.as_ref())
            .find(|output| output.kind() == kind)
    }

    /// Completed or skipped steps as a percentage of all steps.
    #[must_use]
    pub fn progress_percentage(&self) -> u8 {
        let total = self.step_statuses.len();
        if total == 0 {
            return 0;
        }
        let done = self
            .step_statuses
            .iter()
            .filter(|(_, status)| status.satisfies_prerequisite())
            .count();
        u8::try_from(done * 100 / total).unwrap_or(100)
    }

    /// Returns true if the failed step may still be retried.
    #[must_use]
    pub fn can_retry(&self, max_step_failures: u32) -> bool {
        if self.status() != DocumentStatus::Failed {
            return false;
        }
        self.failed_step
            .and_then(|step| self.record(step))
            .is_some_and(|record| record.failure_count < max_step_failures)
    }

    /// Refreshes `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A document as read from the store, with the version to compare against.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedDocument {
    /// The loaded document.
    pub document: Document,
    /// Version for the next compare-and-store.
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Document {
        Document::new(
            "Handbook",
            FileRef::new("uploads/handbook.txt", FileType::Txt),
            StepName::ALL,
        )
    }

    #[test]
    fn test_new_document_is_pending() {
        let doc = sample();

        assert_eq!(doc.status(), DocumentStatus::Pending);
        assert_eq!(doc.step_statuses.len(), 5);
        assert_eq!(doc.step_statuses.count(StepStatus::Pending), 5);
        assert_eq!(doc.retry_count, 0);
        assert!(doc.ingestion_id.as_str().starts_with("ing_"));
        assert_eq!(doc.ingestion_id.as_str().len(), 16);
    }

    #[test]
    fn test_transition_rejects_illegal_moves() {
        let mut statuses = StepStatusMap::pending(StepName::ALL);

        assert!(statuses
            .transition(StepName::ExtractText, StepStatus::Completed)
            .is_err());
        statuses
            .transition(StepName::ExtractText, StepStatus::InProgress)
            .unwrap();
        statuses
            .transition(StepName::ExtractText, StepStatus::Completed)
            .unwrap();

        assert_eq!(statuses.get(StepName::ExtractText), Some(StepStatus::Completed));
    }

    #[test]
    fn test_status_map_serializes_in_pipeline_order() {
        let statuses = StepStatusMap::pending([StepName::ExtractText, StepName::ExtractThemes]);
        let json = serde_json::to_string(&statuses).unwrap();

        assert_eq!(json, r#"{"EXTRACT_TEXT":"PENDING","EXTRACT_THEMES":"PENDING"}"#);

        let back: StepStatusMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, statuses);
    }

    #[test]
    fn test_status_map_rejects_duplicates() {
        let json = r#"{"EXTRACT_TEXT":"PENDING","EXTRACT_TEXT":"COMPLETED"}"#;
        assert!(serde_json::from_str::<StepStatusMap>(json).is_err());
    }

    #[test]
    fn test_validate_order_detects_missing_step() {
        let statuses = StepStatusMap::pending([StepName::ExtractText]);
        assert!(statuses.validate_order(&StepName::ALL).is_err());
        assert!(statuses.validate_order(&[StepName::ExtractText]).is_ok());
    }

    #[test]
    fn test_progress_and_can_retry() {
        let mut doc = sample();
        doc.step_statuses
            .transition(StepName::ExtractText, StepStatus::InProgress)
            .unwrap();
        doc.step_statuses
            .transition(StepName::ExtractText, StepStatus::Completed)
            .unwrap();
        assert_eq!(doc.progress_percentage(), 20);
        assert!(!doc.can_retry(3));

        doc.step_statuses
            .transition(StepName::ExtractThemes, StepStatus::InProgress)
            .unwrap();
        doc.step_statuses
            .transition(StepName::ExtractThemes, StepStatus::Failed)
            .unwrap();
        doc.failed_step = Some(StepName::ExtractThemes);
        doc.record_mut(StepName::ExtractThemes).failure_count = 1;

        assert_eq!(doc.status(), DocumentStatus::Failed);
        assert!(doc.can_retry(3));

        doc.record_mut(StepName::ExtractThemes).failure_count = 3;
        assert!(!doc.can_retry(3));
    }

    #[test]
    fn test_claim_staleness() {
        let started = Utc::now() - Duration::minutes(20);
        let claim = InFlightClaim {
            step: StepName::ExtractText,
            idempotency_key: "k".into(),
            attempt_id: Uuid::new_v4(),
            started_at: started,
        };

        assert!(claim.is_stale(Utc::now(), Duration::minutes(10)));
        assert!(!claim.is_stale(Utc::now(), Duration::hours(1)));
    }

    #[test]
    fn test_document_serialization_keeps_records() {
        let mut doc = sample();
        doc.record_mut(StepName::ExtractText).idempotency_key = Some("key-1".into());

        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();

        assert_eq!(back, doc);
    }
}
