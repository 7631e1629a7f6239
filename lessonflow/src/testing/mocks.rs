//! Scripted operations and fake collaborators for testing.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{DocumentId, ExtractedText, FileRef, StepOutput};
use crate::errors::ProviderError;
use crate::services::{
    AudioSink, Narration, NarrationSynthesizer, StructuredGenerator, TextExtractor,
};

type ScriptedResult = Result<StepOutput, ProviderError>;

/// A step operation that plays back a script of results.
///
/// Results are returned in order; once the script runs out the last entry
/// repeats. Every invocation is counted.
#[derive(Debug)]
pub struct ScriptedOperation {
    script: Mutex<VecDeque<ScriptedResult>>,
    last: Mutex<Option<ScriptedResult>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedOperation {
    /// Plays back `results` in order.
    #[must_use]
    pub fn sequence(results: Vec<ScriptedResult>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Always succeeds with `output`.
    #[must_use]
    pub fn returning(output: StepOutput) -> Self {
        Self::sequence(vec![Ok(output)])
    }

    /// Always fails with `error`.
    #[must_use]
    pub fn failing(error: ProviderError) -> Self {
        Self::sequence(vec![Err(error)])
    }

    /// Sleeps for `delay` before each result.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns how many times the operation ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Runs the next scripted step.
    pub async fn invoke(&self) -> ScriptedResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_result()
    }

    fn next_result(&self) -> ScriptedResult {
        let mut last = self.last.lock();
        if let Some(result) = self.script.lock().pop_front() {
            *last = Some(result);
        }
        last.clone()
            .unwrap_or_else(|| Err(ProviderError::malformed("empty script")))
    }

    /// Returns a closure the engine can call repeatedly.
    pub fn op(self: &Arc<Self>) -> impl FnMut() -> BoxFuture<'static, ScriptedResult> + Send {
        let this = Arc::clone(self);
        move || {
            let this = Arc::clone(&this);
            async move { this.invoke().await }.boxed()
        }
    }
}

/// A text extractor returning fixed text for every file.
#[derive(Debug, Clone)]
pub struct FakeTextExtractor {
    text: String,
}

impl FakeTextExtractor {
    /// Creates an extractor returning `text`.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl TextExtractor for FakeTextExtractor {
    async fn extract(&self, _file: &FileRef) -> Result<ExtractedText, ProviderError> {
        Ok(ExtractedText::counted(self.text.clone()))
    }
}

/// A structured generator answering by the schema's first required field.
///
/// Register a canned response per field (`"themes"`, `"title"`,
/// `"citations"`); unknown schemas are answered with malformed output.
#[derive(Debug, Default)]
pub struct FakeStructuredGenerator {
    responses: DashMap<String, serde_json::Value>,
    calls: AtomicUsize,
}

impl FakeStructuredGenerator {
    /// Creates a generator with no responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers schemas whose first required field is `field` with `response`.
    #[must_use]
    pub fn respond(self, field: &str, response: serde_json::Value) -> Self {
        self.responses.insert(field.to_string(), response);
        self
    }

    /// Returns how many prompts were answered.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StructuredGenerator for FakeStructuredGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let field = schema["required"][0].as_str().unwrap_or_default();
        self.responses
            .get(field)
            .map(|response| response.value().clone())
            .ok_or_else(|| ProviderError::malformed(format!("no response for '{field}'")))
    }
}

/// A narrator producing one byte of audio per character.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeNarrationSynthesizer;

#[async_trait]
impl NarrationSynthesizer for FakeNarrationSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Narration, ProviderError> {
        #[allow(clippy::cast_precision_loss)]
        let duration_seconds = text.split_whitespace().count() as f64 / 2.5;
        Ok(Narration {
            audio: text.bytes().collect(),
            duration_seconds,
        })
    }
}

/// An audio sink keeping audio in memory.
#[derive(Debug, Default)]
pub struct InMemoryAudioSink {
    stored: DashMap<String, Vec<u8>>,
}

impl InMemoryAudioSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the audio stored under `audio_ref`.
    #[must_use]
    pub fn get(&self, audio_ref: &str) -> Option<Vec<u8>> {
        self.stored.get(audio_ref).map(|audio| audio.value().clone())
    }

    /// Returns the number of stored files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stored.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stored.is_empty()
    }
}

#[async_trait]
impl AudioSink for InMemoryAudioSink {
    async fn store(
        &self,
        document_id: &DocumentId,
        audio_key: &str,
        audio: &[u8],
    ) -> Result<String, ProviderError> {
        let audio_ref = format!("memory://audio/{document_id}/{audio_key}.mp3");
        self.stored.insert(audio_ref.clone(), audio.to_vec());
        Ok(audio_ref)
    }
}
