//! Configuration types for the engine, generation and logging.
//!
//! Every struct deserializes from partial JSON; missing fields take their
//! defaults.

use crate::errors::PipelineError;
use crate::pipeline::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

/// Allowed number of themes to request.
pub const THEME_COUNT_RANGE: RangeInclusive<usize> = 3..=7;

/// Engine behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry policy for step operations.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Failed runs a step may accumulate before it must be re-ingested.
    #[serde(default = "default_max_step_failures")]
    pub max_step_failures: u32,
    /// Age after which an in-progress claim may be taken over.
    #[serde(default = "default_stale_claim_after_secs")]
    pub stale_claim_after_secs: u64,
    /// Bound on reload-and-reapply rounds when committing a result.
    #[serde(default = "default_max_commit_attempts")]
    pub max_commit_attempts: u32,
}

fn default_max_step_failures() -> u32 {
    3
}

fn default_stale_claim_after_secs() -> u64 {
    600
}

fn default_max_commit_attempts() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_step_failures: default_max_step_failures(),
            stale_claim_after_secs: default_stale_claim_after_secs(),
            max_commit_attempts: default_max_commit_attempts(),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-step failure cap.
    #[must_use]
    pub fn with_max_step_failures(mut self, failures: u32) -> Self {
        self.max_step_failures = failures;
        self
    }

    /// Sets the stale claim age.
    #[must_use]
    pub fn with_stale_claim_after(mut self, after: Duration) -> Self {
        self.stale_claim_after_secs = after.as_secs();
        self
    }

    /// Sets the commit attempt bound.
    #[must_use]
    pub fn with_max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts;
        self
    }

    /// Returns the stale claim age as a chrono duration.
    #[must_use]
    pub fn stale_claim_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.stale_claim_after_secs).unwrap_or(i64::MAX))
    }

    /// Checks the values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] naming the first bad value.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.max_step_failures == 0 {
            return Err(PipelineError::Config("max_step_failures must be at least 1".into()));
        }
        if self.max_commit_attempts == 0 {
            return Err(PipelineError::Config("max_commit_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Settings for prompts sent to the structured generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSettings {
    /// Themes to request; clamped to 3..=7.
    #[serde(default = "default_num_themes")]
    pub num_themes: usize,
    /// Source characters sent when extracting themes or citations.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    /// Source characters sent when generating the lesson.
    #[serde(default = "default_max_lesson_input_chars")]
    pub max_lesson_input_chars: usize,
    /// Citations to request.
    #[serde(default = "default_num_citations")]
    pub num_citations: usize,
    /// Target lesson length in words.
    #[serde(default = "default_lesson_target_words")]
    pub lesson_target_words: usize,
}

fn default_num_themes() -> usize {
    5
}

fn default_max_input_chars() -> usize {
    12_000
}

fn default_max_lesson_input_chars() -> usize {
    10_000
}

fn default_num_citations() -> usize {
    3
}

fn default_lesson_target_words() -> usize {
    300
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            num_themes: default_num_themes(),
            max_input_chars: default_max_input_chars(),
            max_lesson_input_chars: default_max_lesson_input_chars(),
            num_citations: default_num_citations(),
            lesson_target_words: default_lesson_target_words(),
        }
    }
}

impl GenerationSettings {
    /// Sets the number of themes.
    #[must_use]
    pub fn with_num_themes(mut self, num_themes: usize) -> Self {
        self.num_themes = num_themes;
        self
    }

    /// Sets the input truncation limit.
    #[must_use]
    pub fn with_max_input_chars(mut self, chars: usize) -> Self {
        self.max_input_chars = chars;
        self
    }

    /// Sets the lesson input truncation limit.
    #[must_use]
    pub fn with_max_lesson_input_chars(mut self, chars: usize) -> Self {
        self.max_lesson_input_chars = chars;
        self
    }

    /// Sets the target lesson length.
    #[must_use]
    pub fn with_lesson_target_words(mut self, words: usize) -> Self {
        self.lesson_target_words = words;
        self
    }

    /// Sets the number of citations.
    #[must_use]
    pub fn with_num_citations(mut self, citations: usize) -> Self {
        self.num_citations = citations;
        self
    }

    /// Returns the theme count actually requested.
    #[must_use]
    pub fn theme_count(&self) -> usize {
        self.num_themes
            .clamp(*THEME_COUNT_RANGE.start(), *THEME_COUNT_RANGE.end())
    }
}

/// Logging setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Sets the filter directive.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Switches JSON output on or off.
    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// All settings, as read from one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonflowConfig {
    /// Engine behavior.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Generation settings.
    #[serde(default)]
    pub generation: GenerationSettings,
    /// Logging.
    #[serde(default)]
    pub log: LogConfig,
}

impl LessonflowConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for malformed JSON or bad values.
    pub fn from_json_str(json: &str) -> Result<Self, PipelineError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = LessonflowConfig::default();

        assert_eq!(config.engine.max_step_failures, 3);
        assert_eq!(config.engine.retry.max_attempts, 4);
        assert_eq!(config.generation.max_input_chars, 12_000);
        assert_eq!(config.generation.max_lesson_input_chars, 10_000);
        assert_eq!(config.generation.num_citations, 3);
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn test_partial_json() {
        let config = LessonflowConfig::from_json_str(
            r#"{"engine": {"retry": {"base_delay_ms": 10}}, "log": {"json": true}}"#,
        )
        .unwrap();

        assert_eq!(config.engine.retry.base_delay_ms, 10);
        assert_eq!(config.engine.retry.max_attempts, 4);
        assert_eq!(config.engine.stale_claim_after_secs, 600);
        assert!(config.log.json);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = LessonflowConfig::from_json_str(r#"{"engine": {"max_step_failures": 0}}"#)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));

        assert!(LessonflowConfig::from_json_str("{oops").is_err());
    }

    #[test]
    fn test_theme_count_is_clamped() {
        assert_eq!(GenerationSettings::default().theme_count(), 5);
        assert_eq!(GenerationSettings::default().with_num_themes(1).theme_count(), 3);
        assert_eq!(GenerationSettings::default().with_num_themes(12).theme_count(), 7);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, br#"{"generation": {"num_themes": 4}}"#).unwrap();

        let config = LessonflowConfig::from_file(file.path()).unwrap();
        assert_eq!(config.generation.num_themes, 4);
    }
}
