//! The closed set of pipeline step names and output kinds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A pipeline step.
///
/// Declaration order carries no meaning; pipeline order lives in the
/// [`StepRegistry`](crate::registry::StepRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepName {
    /// Recover plain text from the uploaded file.
    ExtractText,
    /// Identify the document's main themes.
    ExtractThemes,
    /// Write the lesson.
    GenerateLesson,
    /// Pull supporting quotes from the source.
    ExtractCitations,
    /// Narrate the lesson.
    GenerateAudio,
}

impl StepName {
    /// All step names.
    pub const ALL: [Self; 5] = [
        Self::ExtractText,
        Self::ExtractThemes,
        Self::GenerateLesson,
        Self::ExtractCitations,
        Self::GenerateAudio,
    ];

    /// Returns the canonical upper-case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtractText => "EXTRACT_TEXT",
            Self::ExtractThemes => "EXTRACT_THEMES",
            Self::GenerateLesson => "GENERATE_LESSON",
            Self::ExtractCitations => "EXTRACT_CITATIONS",
            Self::GenerateAudio => "GENERATE_AUDIO",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_").to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == wanted)
            .ok_or_else(|| format!("Unknown step: {s}"))
    }
}

/// The kind of artifact a step produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Extracted plain text.
    Text,
    /// A list of themes.
    Themes,
    /// A lesson.
    Lesson,
    /// A list of citations.
    Citations,
    /// A narration audio reference.
    Audio,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Themes => write!(f, "themes"),
            Self::Lesson => write!(f, "lesson"),
            Self::Citations => write!(f, "citations"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_name_round_trips_through_str() {
        for step in StepName::ALL {
            assert_eq!(step.as_str().parse::<StepName>().unwrap(), step);
        }
    }

    #[test]
    fn test_step_name_parses_route_style_names() {
        assert_eq!(
            "extract-themes".parse::<StepName>().unwrap(),
            StepName::ExtractThemes
        );
        assert!("summarize".parse::<StepName>().is_err());
    }

    #[test]
    fn test_step_name_serialize() {
        let json = serde_json::to_string(&StepName::GenerateAudio).unwrap();
        assert_eq!(json, r#""GENERATE_AUDIO""#);
    }
}
