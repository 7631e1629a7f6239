//! Step outputs and the artifacts they carry.

use super::OutputKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Text recovered from the source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedText {
    /// The full text.
    pub text: String,
    /// Number of words as reported by the extractor.
    pub word_count: usize,
}

impl ExtractedText {
    /// Creates extracted text with an explicit word count.
    #[must_use]
    pub fn new(text: impl Into<String>, word_count: usize) -> Self {
        Self {
            text: text.into(),
            word_count,
        }
    }

    /// Creates extracted text, counting whitespace-separated words.
    #[must_use]
    pub fn counted(text: impl Into<String>) -> Self {
        let text = text.into();
        let word_count = text.split_whitespace().count();
        Self { text, word_count }
    }
}

/// A theme identified in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Theme {
    /// Concise theme name.
    pub name: String,
    /// One or two sentences explaining the theme.
    pub description: String,
}

impl Theme {
    /// Creates a theme.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// A learning outcome of a lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningOutcome {
    /// Identifier of the form `lo<N>`.
    pub id: String,
    /// Short action phrase starting with a verb.
    pub title: String,
    /// One sentence explaining mastery.
    pub description: String,
}

/// A generated lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    /// Lesson title.
    pub title: String,
    /// Two or three sentence overview.
    pub summary: String,
    /// Main lesson body.
    pub content: String,
    /// What the reader will gain.
    pub what_youll_learn: String,
    /// Three to five takeaways.
    pub key_takeaways: Vec<String>,
    /// Practical workplace applications.
    pub apply_at_work: String,
    /// Four to six outcomes.
    #[serde(default)]
    pub learning_outcomes: Vec<LearningOutcome>,
    /// Words in `content`.
    #[serde(default)]
    pub word_count: usize,
}

impl Lesson {
    /// Text handed to the narration synthesizer.
    #[must_use]
    pub fn narration_text(&self) -> String {
        format!("{}. {}", self.title, self.content)
    }
}

/// Coarse position of a citation in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum CitationLocation {
    #[serde(rename = "Beginning")]
    Beginning,
    #[serde(rename = "Early section")]
    EarlySection,
    #[serde(rename = "Middle")]
    Middle,
    #[serde(rename = "Late section")]
    LateSection,
    #[serde(rename = "End")]
    End,
    #[serde(rename = "Throughout")]
    Throughout,
}

impl CitationLocation {
    /// All locations, in the order the generator schema lists them.
    pub const ALL: [Self; 6] = [
        Self::Beginning,
        Self::EarlySection,
        Self::Middle,
        Self::LateSection,
        Self::End,
        Self::Throughout,
    ];

    /// Returns the label used on the wire.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Beginning => "Beginning",
            Self::EarlySection => "Early section",
            Self::Middle => "Middle",
            Self::LateSection => "Late section",
            Self::End => "End",
            Self::Throughout => "Throughout",
        }
    }
}

impl fmt::Display for CitationLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a citation's presence in the source was established.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum VerificationMethod {
    /// Not checked yet.
    #[default]
    Unchecked,
    /// Found verbatim after whitespace and case normalization.
    Exact,
    /// Enough snippet words appear in source order.
    Partial {
        /// Fraction of snippet words matched in order.
        ratio: f64,
    },
    /// Neither check passed.
    Unverified {
        /// Fraction of snippet words matched in order.
        ratio: f64,
    },
}

impl VerificationMethod {
    /// Returns true for exact or partial matches.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Exact | Self::Partial { .. })
    }
}

/// A quoted snippet supporting the lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// The quoted text.
    pub snippet: String,
    /// Where in the source the quote sits.
    pub location: CitationLocation,
    /// Which themes the quote supports.
    #[serde(default)]
    pub relevance: String,
    /// 0-100, higher is more relevant.
    pub relevance_score: u8,
    /// Rank within the batch.
    pub order: usize,
    /// Set by the citation verifier only.
    #[serde(default)]
    pub verified: bool,
    /// How `verified` was decided.
    #[serde(default)]
    pub verification: VerificationMethod,
}

impl Citation {
    /// Creates an unchecked citation.
    #[must_use]
    pub fn new(snippet: impl Into<String>, location: CitationLocation) -> Self {
        Self {
            snippet: snippet.into(),
            location,
            relevance: String::new(),
            relevance_score: 0,
            order: 0,
            verified: false,
            verification: VerificationMethod::Unchecked,
        }
    }

    /// Sets the supported themes.
    #[must_use]
    pub fn with_relevance(mut self, relevance: impl Into<String>) -> Self {
        self.relevance = relevance.into();
        self
    }

    /// Sets rank and the score derived from it: 80 for the first, 10 less per rank.
    #[must_use]
    pub fn ranked(mut self, order: usize) -> Self {
        let penalty = u8::try_from(order.saturating_mul(10)).unwrap_or(u8::MAX);
        self.order = order;
        self.relevance_score = 80u8.saturating_sub(penalty);
        self
    }
}

/// Stored narration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioArtifact {
    /// Reference returned by the audio sink.
    pub audio_ref: String,
    /// Narration length.
    pub duration_seconds: f64,
    /// Size of the stored audio.
    pub byte_len: usize,
}

/// The output a step stores on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StepOutput {
    /// Output of text extraction.
    Text(ExtractedText),
    /// Output of theme extraction.
    Themes(Vec<Theme>),
    /// Output of lesson generation.
    Lesson(Lesson),
    /// Output of citation extraction.
    Citations(Vec<Citation>),
    /// Output of narration.
    Audio(AudioArtifact),
}

impl StepOutput {
    /// Returns the kind of this output.
    #[must_use]
    pub fn kind(&self) -> OutputKind {
        match self {
            Self::Text(_) => OutputKind::Text,
            Self::Themes(_) => OutputKind::Themes,
            Self::Lesson(_) => OutputKind::Lesson,
            Self::Citations(_) => OutputKind::Citations,
            Self::Audio(_) => OutputKind::Audio,
        }
    }

    /// Returns the extracted text, if this is a text output.
    #[must_use]
    pub fn as_text(&self) -> Option<&ExtractedText> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the themes, if this is a themes output.
    #[must_use]
    pub fn as_themes(&self) -> Option<&[Theme]> {
        match self {
            Self::Themes(themes) => Some(themes),
            _ => None,
        }
    }

    /// Returns the lesson, if this is a lesson output.
    #[must_use]
    pub fn as_lesson(&self) -> Option<&Lesson> {
        match self {
            Self::Lesson(lesson) => Some(lesson),
            _ => None,
        }
    }

    /// Returns the citations, if this is a citations output.
    #[must_use]
    pub fn as_citations(&self) -> Option<&[Citation]> {
        match self {
            Self::Citations(citations) => Some(citations),
            _ => None,
        }
    }

    /// Returns the audio artifact, if this is an audio output.
    #[must_use]
    pub fn as_audio(&self) -> Option<&AudioArtifact> {
        match self {
            Self::Audio(audio) => Some(audio),
            _ => None,
        }
    }

    /// One-line description for reports and logs.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Text(text) => format!("Extracted {} words", text.word_count),
            Self::Themes(themes) => format!("Identified {} themes", themes.len()),
            Self::Lesson(lesson) => format!("Generated lesson with {} words", lesson.word_count),
            Self::Citations(citations) => {
                let verified = citations.iter().filter(|c| c.verified).count();
                format!("Extracted {} citations ({verified} verified)", citations.len())
            }
            Self::Audio(audio) => {
                format!("Generated audio narration ({:.1} seconds)", audio.duration_seconds)
            }
        }
    }
}
