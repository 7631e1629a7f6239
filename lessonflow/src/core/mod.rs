//! Core domain model types for lessonflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Step names, step statuses and the derived document status
//! - The document aggregate with its per-step records
//! - Step outputs and the artifacts they carry

mod document;
mod output;
mod status;
mod step;

pub use document::{
    Document, DocumentId, FileRef, FileType, InFlightClaim, IngestionId, StepRecord,
    StepStatusMap, VersionedDocument,
};
pub use output::{
    AudioArtifact, Citation, CitationLocation, ExtractedText, LearningOutcome, Lesson,
    StepOutput, Theme, VerificationMethod,
};
pub use status::{DocumentStatus, StepStatus};
pub use step::{OutputKind, StepName};
