//! Prompts, JSON schemas and decoders for the structured generator.
//!
//! Decoders treat generator output as untrusted: anything that does not fit
//! the schema becomes [`ProviderError::ProviderMalformed`].

use crate::config::GenerationSettings;
use crate::core::{Citation, CitationLocation, LearningOutcome, Lesson, Theme};
use crate::errors::ProviderError;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::ops::RangeInclusive;
use std::sync::LazyLock;
use tracing::info;

/// Longest theme name accepted from the generator.
pub const MAX_THEME_NAME_CHARS: usize = 30;

const KEY_TAKEAWAYS: RangeInclusive<usize> = 3..=5;
const LEARNING_OUTCOMES: RangeInclusive<usize> = 4..=6;

#[allow(clippy::expect_used)]
static OUTCOME_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^lo\d+$").expect("valid outcome id regex"));

/// A prompt and the schema its answer must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// The prompt text.
    pub prompt: String,
    /// JSON schema of the expected answer.
    pub schema: Value,
}

/// Cuts `text` to at most `max_chars` characters on a char boundary.
///
/// Logs at info level when anything was cut.
pub fn truncate_chars<'a>(text: &'a str, max_chars: usize, purpose: &str) -> &'a str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => {
            let original_chars = text.chars().count();
            #[allow(clippy::cast_precision_loss)]
            let kept_percent = max_chars as f64 * 100.0 / original_chars as f64;
            info!(
                purpose,
                original_chars,
                kept_chars = max_chars,
                kept_percent = %format!("{kept_percent:.1}"),
                "Truncated source text"
            );
            &text[..end]
        }
        None => text,
    }
}

/// Prompt for theme extraction.
#[must_use]
pub fn themes_prompt(text: &str, settings: &GenerationSettings) -> GenerationRequest {
    let count = settings.theme_count();
    let excerpt = truncate_chars(text, settings.max_input_chars, "theme extraction");
    GenerationRequest {
        prompt: format!(
            "You are an expert content analyst. Extract the most important themes from \
             workplace documents.\n\nExtract exactly {count} main themes from this document:\n\n{excerpt}"
        ),
        schema: themes_schema(count),
    }
}

/// Schema for a list of exactly `count` themes.
#[must_use]
pub fn themes_schema(count: usize) -> Value {
    json!({
        "type": "object",
        "properties": {
            "themes": {
                "type": "array",
                "items": {"$ref": "#/$defs/theme"},
                "minItems": count,
                "maxItems": count,
            }
        },
        "required": ["themes"],
        "additionalProperties": false,
        "$defs": {
            "theme": {
                "type": "object",
                "properties": {
                    "name": {"type": "string", "maxLength": MAX_THEME_NAME_CHARS},
                    "description": {"type": "string"},
                },
                "required": ["name", "description"],
                "additionalProperties": false,
            }
        },
    })
}

fn theme_lines(themes: &[Theme]) -> String {
    themes
        .iter()
        .map(|theme| format!("- {}: {}", theme.name, theme.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prompt for lesson generation.
#[must_use]
pub fn lesson_prompt(
    text: &str,
    themes: &[Theme],
    settings: &GenerationSettings,
) -> GenerationRequest {
    let excerpt = truncate_chars(text, settings.max_lesson_input_chars, "lesson generation");
    GenerationRequest {
        prompt: format!(
            "You are an expert workplace instructional designer. Create a professional \
             workplace learning lesson based on this document and its key themes.\n\n\
             Document excerpt:\n{excerpt}\n\nKey themes:\n{}\n\n\
             Target word count for main content: ~{} words.\n\
             Tone: Professional, approachable, practical.",
            theme_lines(themes),
            settings.lesson_target_words,
        ),
        schema: lesson_schema(),
    }
}

/// Schema for a lesson.
#[must_use]
pub fn lesson_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "summary": {"type": "string"},
            "content": {"type": "string"},
            "what_youll_learn": {"type": "string"},
            "key_takeaways": {
                "type": "array",
                "items": {"type": "string"},
                "minItems": KEY_TAKEAWAYS.start(),
                "maxItems": KEY_TAKEAWAYS.end(),
            },
            "apply_at_work": {"type": "string"},
            "learning_outcomes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string", "pattern": "^lo\\d+$"},
                        "title": {"type": "string"},
                        "description": {"type": "string"},
                    },
                    "required": ["id", "title", "description"],
                    "additionalProperties": false,
                },
                "minItems": LEARNING_OUTCOMES.start(),
                "maxItems": LEARNING_OUTCOMES.end(),
            },
        },
        "required": [
            "title", "summary", "content", "what_youll_learn",
            "key_takeaways", "apply_at_work", "learning_outcomes"
        ],
        "additionalProperties": false,
    })
}

/// Prompt for citation extraction.
#[must_use]
pub fn citations_prompt(
    text: &str,
    themes: &[Theme],
    settings: &GenerationSettings,
) -> GenerationRequest {
    let excerpt = truncate_chars(text, settings.max_input_chars, "citation extraction");
    let names = themes
        .iter()
        .map(|theme| theme.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    GenerationRequest {
        prompt: format!(
            "Extract the most relevant direct quotes that support the given themes.\n\n\
             Themes: {names}\n\nDocument:\n{excerpt}\n\n\
             Extract {} best supporting quotes. Copy each quote exactly as written.",
            settings.num_citations
        ),
        schema: citations_schema(),
    }
}

/// Schema for a list of citations.
#[must_use]
pub fn citations_schema() -> Value {
    let locations: Vec<&str> = CitationLocation::ALL.iter().map(CitationLocation::label).collect();
    json!({
        "type": "object",
        "properties": {
            "citations": {
                "type": "array",
                "items": {"$ref": "#/$defs/citation"},
            }
        },
        "required": ["citations"],
        "additionalProperties": false,
        "$defs": {
            "citation": {
                "type": "object",
                "properties": {
                    "snippet": {"type": "string"},
                    "location": {"type": "string", "enum": locations},
                    "relevance": {"type": "string"},
                },
                "required": ["snippet", "location", "relevance"],
                "additionalProperties": false,
            }
        },
    })
}

fn parse<T: for<'de> Deserialize<'de>>(value: Value, what: &str) -> Result<T, ProviderError> {
    serde_json::from_value(value)
        .map_err(|e| ProviderError::malformed(format!("{what} do not match the schema: {e}")))
}

#[derive(Deserialize)]
struct ThemesPayload {
    themes: Vec<Theme>,
}

/// Decodes and validates generated themes.
///
/// # Errors
///
/// [`ProviderError::ProviderMalformed`] for a wrong shape, no themes, or a
/// blank or overlong theme name.
pub fn decode_themes(value: Value) -> Result<Vec<Theme>, ProviderError> {
    let payload: ThemesPayload = parse(value, "themes")?;
    if payload.themes.is_empty() {
        return Err(ProviderError::malformed("no themes returned"));
    }

    payload
        .themes
        .into_iter()
        .map(|theme| {
            let name = theme.name.trim();
            if name.is_empty() {
                return Err(ProviderError::malformed("theme with an empty name"));
            }
            if name.chars().count() > MAX_THEME_NAME_CHARS {
                return Err(ProviderError::malformed(format!(
                    "theme name '{name}' is longer than {MAX_THEME_NAME_CHARS} characters"
                )));
            }
            Ok(Theme::new(name, theme.description.trim()))
        })
        .collect()
}

/// Decodes and validates a generated lesson.
///
/// Fills in the word count of the lesson body.
///
/// # Errors
///
/// [`ProviderError::EmptyContent`] for a lesson without a body, and
/// [`ProviderError::ProviderMalformed`] when takeaways or outcomes are out of
/// range or an outcome id is not of the form `lo<N>`.
pub fn decode_lesson(value: Value) -> Result<Lesson, ProviderError> {
    let mut lesson: Lesson = parse(value, "lesson fields")?;
    if lesson.content.trim().is_empty() {
        return Err(ProviderError::empty("generated lesson has no content"));
    }
    if !KEY_TAKEAWAYS.contains(&lesson.key_takeaways.len()) {
        return Err(ProviderError::malformed(format!(
            "expected {}-{} key takeaways, got {}",
            KEY_TAKEAWAYS.start(),
            KEY_TAKEAWAYS.end(),
            lesson.key_takeaways.len()
        )));
    }
    if !LEARNING_OUTCOMES.contains(&lesson.learning_outcomes.len()) {
        return Err(ProviderError::malformed(format!(
            "expected {}-{} learning outcomes, got {}",
            LEARNING_OUTCOMES.start(),
            LEARNING_OUTCOMES.end(),
            lesson.learning_outcomes.len()
        )));
    }
    if let Some(bad) = lesson
        .learning_outcomes
        .iter()
        .find(|outcome: &&LearningOutcome| !OUTCOME_ID.is_match(&outcome.id))
    {
        return Err(ProviderError::malformed(format!(
            "learning outcome id '{}' is not of the form lo<N>",
            bad.id
        )));
    }

    lesson.word_count = lesson.content.split_whitespace().count();
    Ok(lesson)
}

#[derive(Deserialize)]
struct RawCitation {
    snippet: String,
    location: CitationLocation,
    #[serde(default)]
    relevance: String,
}

#[derive(Deserialize)]
struct CitationsPayload {
    citations: Vec<RawCitation>,
}

/// Decodes generated citations and ranks them in the order given.
///
/// Blank snippets are dropped. Verification happens later, against the full
/// source text.
///
/// # Errors
///
/// [`ProviderError::ProviderMalformed`] for a wrong shape or an unknown
/// location.
pub fn decode_citations(value: Value) -> Result<Vec<Citation>, ProviderError> {
    let payload: CitationsPayload = parse(value, "citations")?;
    Ok(payload
        .citations
        .into_iter()
        .filter(|raw| !raw.snippet.trim().is_empty())
        .enumerate()
        .map(|(order, raw)| {
            Citation::new(raw.snippet.trim(), raw.location)
                .with_relevance(raw.relevance)
                .ranked(order)
        })
        .collect())
}
