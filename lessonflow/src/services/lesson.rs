//! The caller-facing surface: one operation per step.

use super::prompts::{
    citations_prompt, decode_citations, decode_lesson, decode_themes, lesson_prompt,
    themes_prompt, GenerationRequest,
};
use super::{AudioSink, Narration, NarrationSynthesizer, StructuredGenerator, TextExtractor};
use crate::config::GenerationSettings;
use crate::core::{AudioArtifact, Document, DocumentId, Lesson, StepName, StepOutput, Theme};
use crate::errors::{PipelineError, ProviderError};
use crate::pipeline::{step_idempotency_key, PipelineEngine, ProcessingStatus, StepReport};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

type StepOperation =
    Box<dyn FnMut() -> BoxFuture<'static, Result<StepOutput, ProviderError>> + Send>;

/// Runs the document-to-lesson steps against real collaborators.
///
/// Every step operation is built from data already stored on the document,
/// so a step request needs only the document id and an idempotency key.
pub struct LessonPipeline {
    engine: Arc<PipelineEngine>,
    extractor: Arc<dyn TextExtractor>,
    generator: Arc<dyn StructuredGenerator>,
    narrator: Arc<dyn NarrationSynthesizer>,
    audio_sink: Arc<dyn AudioSink>,
    settings: GenerationSettings,
}

impl std::fmt::Debug for LessonPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LessonPipeline")
            .field("engine", &self.engine)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl LessonPipeline {
    /// Creates a pipeline with default generation settings.
    #[must_use]
    pub fn new(
        engine: Arc<PipelineEngine>,
        extractor: Arc<dyn TextExtractor>,
        generator: Arc<dyn StructuredGenerator>,
        narrator: Arc<dyn NarrationSynthesizer>,
        audio_sink: Arc<dyn AudioSink>,
    ) -> Self {
        Self {
            engine,
            extractor,
            generator,
            narrator,
            audio_sink,
            settings: GenerationSettings::default(),
        }
    }

    /// Sets the generation settings.
    #[must_use]
    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns the engine.
    #[must_use]
    pub fn engine(&self) -> &PipelineEngine {
        &self.engine
    }

    /// Returns the generation settings.
    #[must_use]
    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    /// Extracts the text of the uploaded file.
    pub async fn extract_text(
        &self,
        id: &DocumentId,
        idempotency_key: &str,
    ) -> Result<StepReport, PipelineError> {
        self.run_step(id, StepName::ExtractText, idempotency_key).await
    }

    /// Identifies the document's themes.
    pub async fn extract_themes(
        &self,
        id: &DocumentId,
        idempotency_key: &str,
    ) -> Result<StepReport, PipelineError> {
        self.run_step(id, StepName::ExtractThemes, idempotency_key)
            .await
    }

    /// Generates the lesson from the text and themes.
    pub async fn generate_lesson(
        &self,
        id: &DocumentId,
        idempotency_key: &str,
    ) -> Result<StepReport, PipelineError> {
        self.run_step(id, StepName::GenerateLesson, idempotency_key)
            .await
    }

    /// Extracts supporting quotes and verifies them against the text.
    pub async fn extract_citations(
        &self,
        id: &DocumentId,
        idempotency_key: &str,
    ) -> Result<StepReport, PipelineError> {
        self.run_step(id, StepName::ExtractCitations, idempotency_key)
            .await
    }

    /// Narrates the lesson and stores the audio.
    pub async fn generate_audio(
        &self,
        id: &DocumentId,
        idempotency_key: &str,
    ) -> Result<StepReport, PipelineError> {
        self.run_step(id, StepName::GenerateAudio, idempotency_key)
            .await
    }

    /// Requests any step by name.
    ///
    /// # Errors
    ///
    /// As [`PipelineEngine::advance`].
    pub async fn run_step(
        &self,
        id: &DocumentId,
        step: StepName,
        idempotency_key: &str,
    ) -> Result<StepReport, PipelineError> {
        let document = self.engine.document(id).await?;
        let operation = self.operation(&document, step, idempotency_key)?;
        self.engine
            .advance(id, step, idempotency_key, operation)
            .await
    }

    /// Re-runs the step the document failed on.
    ///
    /// # Errors
    ///
    /// [`PipelineError::NotFailed`] if the document is not failed, otherwise
    /// as [`PipelineEngine::retry_failed_step`].
    pub async fn retry_failed_step(
        &self,
        id: &DocumentId,
        idempotency_key: &str,
    ) -> Result<StepReport, PipelineError> {
        let document = self.engine.document(id).await?;
        let step = document.failed_step.ok_or_else(|| PipelineError::NotFailed {
            document_id: id.to_string(),
        })?;
        let operation = self.operation(&document, step, idempotency_key)?;
        self.engine
            .retry_failed_step(id, step, idempotency_key, operation)
            .await
    }

    /// Skips a skippable step.
    pub async fn skip_step(
        &self,
        id: &DocumentId,
        step: StepName,
        reason: &str,
    ) -> Result<StepReport, PipelineError> {
        self.engine.skip_step(id, step, reason).await
    }

    /// Reports processing progress.
    pub async fn processing_status(
        &self,
        id: &DocumentId,
    ) -> Result<ProcessingStatus, PipelineError> {
        self.engine.status(id).await
    }

    fn operation(
        &self,
        document: &Document,
        step: StepName,
        idempotency_key: &str,
    ) -> Result<StepOperation, PipelineError> {
        if !self.engine.registry().contains(step) {
            return Err(PipelineError::UnknownStep(step));
        }
        debug!(document_id = %document.id, step = %step, "Building step operation");

        let operation = match step {
            StepName::ExtractText => {
                let extractor = Arc::clone(&self.extractor);
                let file = document.file_ref.clone();
                Box::new(move || {
                    let extractor = Arc::clone(&extractor);
                    let file = file.clone();
                    async move {
                        let text = extractor.extract(&file).await?;
                        if text.text.trim().is_empty() {
                            return Err(ProviderError::empty(format!(
                                "no text could be extracted from {}",
                                file.location
                            )));
                        }
                        Ok(StepOutput::Text(text))
                    }
                    .boxed()
                }) as StepOperation
            }
            StepName::ExtractThemes => {
                let text = self.text_of(document, step)?;
                let request = themes_prompt(&text, &self.settings);
                self.generate(request, |value| decode_themes(value).map(StepOutput::Themes))
            }
            StepName::GenerateLesson => {
                let text = self.text_of(document, step)?;
                let themes = self.themes_of(document, step)?;
                let request = lesson_prompt(&text, &themes, &self.settings);
                self.generate(request, |value| decode_lesson(value).map(StepOutput::Lesson))
            }
            StepName::ExtractCitations => {
                let text = self.text_of(document, step)?;
                let themes = self.themes_of(document, step)?;
                let request = citations_prompt(&text, &themes, &self.settings);
                self.generate(request, |value| {
                    decode_citations(value).map(StepOutput::Citations)
                })
            }
            StepName::GenerateAudio => {
                let narration_text = document
                    .output(StepName::GenerateLesson)
                    .and_then(StepOutput::as_lesson)
                    .map(Lesson::narration_text)
                    .ok_or_else(|| self.missing_input(document, step, "lesson"))?;
                let narrator = Arc::clone(&self.narrator);
                let audio_sink = Arc::clone(&self.audio_sink);
                let document_id = document.id;
                let audio_key = step_idempotency_key(&document.id, step, idempotency_key);
                let synthesized: Arc<Mutex<Option<Arc<Narration>>>> = Arc::default();
                Box::new(move || {
                    let narrator = Arc::clone(&narrator);
                    let audio_sink = Arc::clone(&audio_sink);
                    let synthesized = Arc::clone(&synthesized);
                    let audio_key = audio_key.clone();
                    let text = narration_text.clone();
                    async move {
                        // A sink failure retries the store only.
                        let cached = synthesized.lock().clone();
                        let narration = match cached {
                            Some(narration) => narration,
                            None => {
                                let narration = narrator.synthesize(&text).await?;
                                if narration.audio.is_empty() {
                                    return Err(ProviderError::empty("narration produced no audio"));
                                }
                                let narration = Arc::new(narration);
                                *synthesized.lock() = Some(Arc::clone(&narration));
                                narration
                            }
                        };
                        let audio_ref = audio_sink
                            .store(&document_id, &audio_key, &narration.audio)
                            .await?;
                        Ok(StepOutput::Audio(AudioArtifact {
                            audio_ref,
                            duration_seconds: narration.duration_seconds,
                            byte_len: narration.audio.len(),
                        }))
                    }
                    .boxed()
                }) as StepOperation
            }
        };
        Ok(operation)
    }

    fn generate<D>(&self, request: GenerationRequest, decode: D) -> StepOperation
    where
        D: Fn(serde_json::Value) -> Result<StepOutput, ProviderError> + Clone + Send + Sync + 'static,
    {
        let generator = Arc::clone(&self.generator);
        let request = Arc::new(request);
        Box::new(move || {
            let generator = Arc::clone(&generator);
            let request = Arc::clone(&request);
            let decode = decode.clone();
            async move {
                let value = generator.generate(&request.prompt, &request.schema).await?;
                decode(value)
            }
            .boxed()
        })
    }

    fn text_of(&self, document: &Document, step: StepName) -> Result<String, PipelineError> {
        document
            .output(StepName::ExtractText)
            .and_then(StepOutput::as_text)
            .map(|text| text.text.clone())
            .ok_or_else(|| self.missing_input(document, step, "extracted text"))
    }

    fn themes_of(&self, document: &Document, step: StepName) -> Result<Vec<Theme>, PipelineError> {
        document
            .output(StepName::ExtractThemes)
            .and_then(StepOutput::as_themes)
            .map(<[Theme]>::to_vec)
            .ok_or_else(|| self.missing_input(document, step, "themes"))
    }

    /// Explains why an input of `step` is not on the document.
    fn missing_input(&self, document: &Document, step: StepName, what: &str) -> PipelineError {
        let unmet = self.engine.registry().prerequisite(step).and_then(|prerequisite| {
            document
                .step_status(prerequisite)
                .ok()
                .filter(|status| !status.satisfies_prerequisite())
                .map(|status| PipelineError::PrerequisiteNotMet {
                    step,
                    prerequisite,
                    status,
                })
        });
        unmet.unwrap_or_else(|| {
            PipelineError::CorruptState(format!(
                "document {} has no {what} for step '{step}'",
                document.id
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::{ExtractedText, FileRef, FileType, StepStatus};
    use crate::pipeline::RetryPolicy;
    use crate::services::{
        MockAudioSink, MockNarrationSynthesizer, MockStructuredGenerator, MockTextExtractor,
        Narration,
    };
    use crate::store::{DocumentStore, InMemoryDocumentStore};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn engine() -> Arc<PipelineEngine> {
        Arc::new(
            PipelineEngine::new(Arc::new(InMemoryDocumentStore::new())).with_config(
                EngineConfig::default()
                    .with_retry(RetryPolicy::new().with_max_attempts(3).with_base_delay_ms(1)),
            ),
        )
    }

    fn pipeline(
        engine: Arc<PipelineEngine>,
        extractor: MockTextExtractor,
        generator: MockStructuredGenerator,
    ) -> LessonPipeline {
        LessonPipeline::new(
            engine,
            Arc::new(extractor),
            Arc::new(generator),
            Arc::new(MockNarrationSynthesizer::new()),
            Arc::new(MockAudioSink::new()),
        )
    }

    #[tokio::test]
    async fn test_extract_text_calls_extractor_once_per_key() {
        let engine = engine();
        let doc = engine
            .create_document("Guide", FileRef::new("guide.pdf", FileType::Pdf))
            .await
            .unwrap();
        let mut extractor = MockTextExtractor::new();
        extractor
            .expect_extract()
            .times(1)
            .returning(|_| Ok(ExtractedText::counted("lift with your legs")));
        let lessons = pipeline(engine, extractor, MockStructuredGenerator::new());

        let first = lessons.extract_text(&doc.id, "k1").await.unwrap();
        let second = lessons.extract_text(&doc.id, "k1").await.unwrap();

        assert_eq!(first.status, StepStatus::Completed);
        assert_eq!(first.output, second.output);
        assert_eq!(first.next_step, Some(StepName::ExtractThemes));
    }

    #[tokio::test]
    async fn test_blank_text_fails_without_retry() {
        let engine = engine();
        let doc = engine
            .create_document("Scan", FileRef::new("scan.pdf", FileType::Pdf))
            .await
            .unwrap();
        let mut extractor = MockTextExtractor::new();
        extractor
            .expect_extract()
            .times(1)
            .returning(|_| Ok(ExtractedText::counted("   ")));
        let lessons = pipeline(engine, extractor, MockStructuredGenerator::new());

        let report = lessons.extract_text(&doc.id, "k1").await.unwrap();

        assert!(report.is_failed());
        assert!(report.failure.unwrap().cause.contains("scan.pdf"));
    }

    #[tokio::test]
    async fn test_themes_before_text_is_prerequisite_error() {
        let engine = engine();
        let doc = engine
            .create_document("Guide", FileRef::new("guide.txt", FileType::Txt))
            .await
            .unwrap();
        let mut generator = MockStructuredGenerator::new();
        generator.expect_generate().never();
        let lessons = pipeline(engine, MockTextExtractor::new(), generator);

        let err = lessons.extract_themes(&doc.id, "k1").await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::PrerequisiteNotMet {
                step: StepName::ExtractThemes,
                prerequisite: StepName::ExtractText,
                status: StepStatus::Pending
            }
        ));
    }

    #[tokio::test]
    async fn test_themes_retry_transient_generator_errors() {
        let engine = engine();
        let doc = engine
            .create_document("Guide", FileRef::new("guide.txt", FileType::Txt))
            .await
            .unwrap();
        let mut extractor = MockTextExtractor::new();
        extractor
            .expect_extract()
            .returning(|_| Ok(ExtractedText::counted("safety first always")));
        let mut generator = MockStructuredGenerator::new();
        let mut seq = mockall::Sequence::new();
        generator
            .expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(ProviderError::rate_limited("429")));
        generator
            .expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|prompt, schema| {
                prompt.contains("safety first always") && schema["required"][0] == "themes"
            })
            .returning(|_, _| {
                Ok(json!({"themes": [{"name": "Safety", "description": "Stay safe."}]}))
            });
        let lessons = pipeline(engine, extractor, generator);

        lessons.extract_text(&doc.id, "k1").await.unwrap();
        let report = lessons.extract_themes(&doc.id, "k2").await.unwrap();

        assert_eq!(report.attempts, 2);
        assert_eq!(
            report.output.and_then(|o| o.as_themes().map(<[Theme]>::to_vec)),
            Some(vec![Theme::new("Safety", "Stay safe.")])
        );
    }

    #[tokio::test]
    async fn test_audio_is_narrated_and_stored() {
        let engine = engine();
        let doc = engine
            .create_document("Guide", FileRef::new("guide.txt", FileType::Txt))
            .await
            .unwrap();
        let mut extractor = MockTextExtractor::new();
        extractor
            .expect_extract()
            .returning(|_| Ok(ExtractedText::counted("Bend your knees.")));
        let mut generator = MockStructuredGenerator::new();
        generator.expect_generate().returning(|_, schema| {
            if schema["required"][0] == "themes" {
                return Ok(json!({"themes": [{"name": "Lifting", "description": "Lift well."}]}));
            }
            Ok(json!({
                "title": "Lifting",
                "summary": "Lift well.",
                "content": "Bend your knees.",
                "what_youll_learn": "Technique.",
                "key_takeaways": ["a", "b", "c"],
                "apply_at_work": "Warehouse.",
                "learning_outcomes": [
                    {"id": "lo1", "title": "Bend", "description": "d"},
                    {"id": "lo2", "title": "Hold", "description": "d"},
                    {"id": "lo3", "title": "Lift", "description": "d"},
                    {"id": "lo4", "title": "Place", "description": "d"}
                ]
            }))
        });
        let mut narrator = MockNarrationSynthesizer::new();
        narrator
            .expect_synthesize()
            .withf(|text| text.to_string() == "Lifting. Bend your knees.")
            .times(1)
            .returning(|_| {
                Ok(Narration {
                    audio: vec![1, 2, 3],
                    duration_seconds: 2.5,
                })
            });
        let mut audio_sink = MockAudioSink::new();
        audio_sink
            .expect_store()
            .times(1)
            .returning(|id, _, _| Ok(format!("audio/{id}.mp3")));
        let lessons = LessonPipeline::new(
            Arc::clone(&engine),
            Arc::new(extractor),
            Arc::new(generator),
            Arc::new(narrator),
            Arc::new(audio_sink),
        );

        lessons.extract_text(&doc.id, "k1").await.unwrap();
        lessons.extract_themes(&doc.id, "k2").await.unwrap();
        lessons.generate_lesson(&doc.id, "k3").await.unwrap();
        lessons
            .skip_step(&doc.id, StepName::ExtractCitations, "not needed")
            .await
            .unwrap();
        let report = lessons.generate_audio(&doc.id, "k5").await.unwrap();

        let audio = report.output.and_then(|o| o.as_audio().cloned()).unwrap();
        assert_eq!(audio.audio_ref, format!("audio/{}.mp3", doc.id));
        assert_eq!(audio.byte_len, 3);
        let status = lessons.processing_status(&doc.id).await.unwrap();
        assert_eq!(status.progress_percentage, 100);
        assert!(status.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_audio_store_retry_reuses_narration() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let engine = Arc::new(
            PipelineEngine::new(store.clone()).with_config(
                EngineConfig::default()
                    .with_retry(RetryPolicy::new().with_max_attempts(3).with_base_delay_ms(1)),
            ),
        );
        let mut doc = engine
            .create_document("Guide", FileRef::new("guide.txt", FileType::Txt))
            .await
            .unwrap();
        for step in [
            StepName::ExtractText,
            StepName::ExtractThemes,
            StepName::GenerateLesson,
            StepName::ExtractCitations,
        ] {
            doc.step_statuses.transition(step, StepStatus::InProgress).unwrap();
            doc.step_statuses.transition(step, StepStatus::Completed).unwrap();
        }
        let lesson = decode_lesson(json!({
            "title": "Lifting",
            "summary": "Lift well.",
            "content": "Bend your knees.",
            "what_youll_learn": "Technique.",
            "key_takeaways": ["a", "b", "c"],
            "apply_at_work": "Warehouse.",
            "learning_outcomes": [
                {"id": "lo1", "title": "Bend", "description": "d"},
                {"id": "lo2", "title": "Hold", "description": "d"},
                {"id": "lo3", "title": "Lift", "description": "d"},
                {"id": "lo4", "title": "Place", "description": "d"}
            ]
        }))
        .unwrap();
        doc.record_mut(StepName::GenerateLesson).output = Some(StepOutput::Lesson(lesson));
        store.compare_and_store(&doc, 1).await.unwrap();

        let mut narrator = MockNarrationSynthesizer::new();
        narrator.expect_synthesize().times(1).returning(|_| {
            Ok(Narration {
                audio: vec![4, 5],
                duration_seconds: 1.0,
            })
        });
        let expected_key = step_idempotency_key(&doc.id, StepName::GenerateAudio, "k5");
        let mut audio_sink = MockAudioSink::new();
        let mut seq = mockall::Sequence::new();
        audio_sink
            .expect_store()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(ProviderError::TransientIo("bucket busy".into())));
        audio_sink
            .expect_store()
            .withf(move |_, key, audio| {
                key.to_string() == expected_key && audio.to_vec() == vec![4u8, 5]
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, key, _| Ok(format!("audio/{key}.mp3")));
        let lessons = LessonPipeline::new(
            Arc::clone(&engine),
            Arc::new(MockTextExtractor::new()),
            Arc::new(MockStructuredGenerator::new()),
            Arc::new(narrator),
            Arc::new(audio_sink),
        );

        let report = lessons.generate_audio(&doc.id, "k5").await.unwrap();

        assert_eq!(report.status, StepStatus::Completed);
        assert_eq!(report.attempts, 2);
        let audio = report.output.and_then(|o| o.as_audio().cloned()).unwrap();
        assert_eq!(
            audio.audio_ref,
            format!(
                "audio/{}.mp3",
                step_idempotency_key(&doc.id, StepName::GenerateAudio, "k5")
            )
        );
    }

    #[tokio::test]
    async fn test_retry_failed_step_needs_failed_document() {
        let engine = engine();
        let doc = engine
            .create_document("Guide", FileRef::new("guide.txt", FileType::Txt))
            .await
            .unwrap();
        let lessons = pipeline(engine, MockTextExtractor::new(), MockStructuredGenerator::new());

        let err = lessons.retry_failed_step(&doc.id, "k").await.unwrap_err();

        assert!(matches!(err, PipelineError::NotFailed { .. }));
    }
}
