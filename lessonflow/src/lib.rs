//! # Lessonflow
//!
//! A step orchestration engine for turning uploaded documents into lessons.
//!
//! A document moves through a fixed, linear pipeline of externally serviced
//! steps: text extraction, theme extraction, lesson generation, citation
//! extraction and narration. Lessonflow tracks that progress with:
//!
//! - **Prerequisite ordering**: a step runs only after the one before it is
//!   completed or skipped
//! - **Idempotent requests**: the same idempotency key never runs a step twice
//! - **Bounded retries**: transient provider errors are retried with
//!   exponential backoff, fatal ones fail the step at once
//! - **Optimistic concurrency**: every transition is a compare-and-store, so
//!   racing callers see one winner
//! - **Citation verification**: generated quotes are checked against the
//!   source text before they are stored
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lessonflow::prelude::*;
//! use std::sync::Arc;
//!
//! let engine = Arc::new(PipelineEngine::new(Arc::new(InMemoryDocumentStore::new())));
//! let lessons = LessonPipeline::new(engine.clone(), extractor, generator, narrator, audio);
//!
//! let doc = engine.create_document("Handbook", FileRef::new("handbook.pdf", FileType::Pdf)).await?;
//! lessons.extract_text(&doc.id, "req-1").await?;
//! lessons.extract_themes(&doc.id, "req-2").await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod citations;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod services;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{EngineConfig, GenerationSettings, LessonflowConfig, LogConfig};
    pub use crate::core::{
        Citation, Document, DocumentId, DocumentStatus, FileRef, FileType, Lesson, StepName,
        StepOutput, StepStatus, Theme,
    };
    pub use crate::errors::{PipelineError, ProviderError, RetryClass};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{
        Disposition, PipelineEngine, ProcessingStatus, RetryPolicy, StepReport,
    };
    pub use crate::registry::{StepDefinition, StepRegistry};
    pub use crate::services::{
        AudioSink, LessonPipeline, Narration, NarrationSynthesizer, StructuredGenerator,
        TextExtractor,
    };
    pub use crate::store::{DocumentStore, InMemoryDocumentStore, JsonFileDocumentStore};
}
