//! External collaborators and the caller-facing lesson pipeline.
//!
//! The engine never talks to a provider directly. Each step operation is
//! built here from one of these traits, so tests and deployments can swap
//! the provider without touching the state machine.

mod lesson;
mod prompts;

pub use lesson::LessonPipeline;
pub use prompts::{
    citations_prompt, citations_schema, decode_citations, decode_lesson, decode_themes,
    lesson_prompt, lesson_schema, themes_prompt, themes_schema, truncate_chars, GenerationRequest,
    MAX_THEME_NAME_CHARS,
};

use crate::core::{DocumentId, ExtractedText, FileRef};
use crate::errors::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Extracts plain text from an uploaded file.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Returns the text of the file.
    ///
    /// # Errors
    ///
    /// [`ProviderError::EmptyContent`] when nothing could be read and
    /// [`ProviderError::UnsupportedFormat`] for unreadable files.
    async fn extract(&self, file: &FileRef) -> Result<ExtractedText, ProviderError>;
}

/// A model answering prompts with JSON matching a schema.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StructuredGenerator: Send + Sync {
    /// Generates a JSON value for `prompt` that should satisfy `schema`.
    ///
    /// The result is validated by the caller; a generator is not trusted to
    /// honor the schema.
    ///
    /// # Errors
    ///
    /// Timeouts and rate limits are retriable; malformed output is not.
    async fn generate(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;
}

/// Synthesized speech for a piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narration {
    /// Encoded audio.
    pub audio: Vec<u8>,
    /// Length of the audio.
    pub duration_seconds: f64,
}

/// Text-to-speech.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NarrationSynthesizer: Send + Sync {
    /// Narrates `text`.
    ///
    /// # Errors
    ///
    /// Same retriable/fatal split as [`StructuredGenerator`].
    async fn synthesize(&self, text: &str) -> Result<Narration, ProviderError>;
}

/// Durable storage for narration audio.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Stores the audio under `audio_key` and returns a reference to it.
    ///
    /// Storing the same key again replaces the earlier audio.
    ///
    /// # Errors
    ///
    /// [`ProviderError::TransientIo`] for failures worth retrying.
    async fn store(
        &self,
        document_id: &DocumentId,
        audio_key: &str,
        audio: &[u8],
    ) -> Result<String, ProviderError>;
}
