//! Snippet verification against source text.

use crate::core::{Citation, VerificationMethod};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Minimum fraction of snippet words that must appear in source order.
pub const PARTIAL_MATCH_THRESHOLD: f64 = 0.60;

#[allow(clippy::expect_used)]
static WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{L}\p{N}]+(?:['’][\p{L}\p{N}]+)*").expect("word pattern is valid")
});

/// Collapses whitespace runs to single spaces and case-folds.
#[must_use]
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn words(normalized: &str) -> Vec<&str> {
    WORD.find_iter(normalized).map(|m| m.as_str()).collect()
}

/// Length of the longest common subsequence of two word lists.
fn common_subsequence_len(snippet: &[&str], source: &[&str]) -> usize {
    let mut row = vec![0usize; snippet.len() + 1];
    for word in source {
        let mut diagonal = 0;
        for (i, candidate) in snippet.iter().enumerate() {
            let above = row[i + 1];
            row[i + 1] = if candidate == word {
                diagonal + 1
            } else {
                above.max(row[i])
            };
            diagonal = above;
        }
    }
    row[snippet.len()]
}

/// A normalized source, reusable across a batch of snippets.
#[derive(Debug, Clone)]
pub struct SourceIndex {
    normalized: String,
}

impl SourceIndex {
    /// Normalizes the source text once.
    #[must_use]
    pub fn new(source: &str) -> Self {
        Self {
            normalized: normalize(source),
        }
    }

    /// Decides how a single snippet is supported by the source.
    #[must_use]
    pub fn check(&self, snippet: &str) -> VerificationMethod {
        let needle = normalize(snippet);
        if needle.is_empty() {
            return VerificationMethod::Unverified { ratio: 0.0 };
        }
        if self.normalized.contains(&needle) {
            return VerificationMethod::Exact;
        }

        let snippet_words = words(&needle);
        if snippet_words.is_empty() {
            return VerificationMethod::Unverified { ratio: 0.0 };
        }
        let source_words = words(&self.normalized);
        let matched = common_subsequence_len(&snippet_words, &source_words);
        #[allow(clippy::cast_precision_loss)]
        let ratio = matched as f64 / snippet_words.len() as f64;

        if ratio >= PARTIAL_MATCH_THRESHOLD {
            VerificationMethod::Partial { ratio }
        } else {
            VerificationMethod::Unverified { ratio }
        }
    }
}

/// Checks one snippet against the source.
#[must_use]
pub fn verify_snippet(snippet: &str, source: &str) -> VerificationMethod {
    SourceIndex::new(source).check(snippet)
}

/// Marks every citation verified or unverified against the source.
///
/// All citations are returned, in their original order.
#[must_use]
pub fn verify(citations: Vec<Citation>, source: &str) -> Vec<Citation> {
    let index = SourceIndex::new(source);
    citations
        .into_iter()
        .map(|mut citation| {
            let method = index.check(&citation.snippet);
            citation.verified = method.is_verified();
            citation.verification = method;
            citation
        })
        .collect()
}

/// Counts of verification outcomes in a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSummary {
    /// Citations in the batch.
    pub total: usize,
    /// Found verbatim.
    pub exact: usize,
    /// Accepted on word order.
    pub partial: usize,
    /// Not supported by the source.
    pub unverified: usize,
}

impl VerificationSummary {
    /// Tallies a verified batch.
    #[must_use]
    pub fn of(citations: &[Citation]) -> Self {
        citations.iter().fold(Self::default(), |mut acc, citation| {
            acc.total += 1;
            match citation.verification {
                VerificationMethod::Exact => acc.exact += 1,
                VerificationMethod::Partial { .. } => acc.partial += 1,
                VerificationMethod::Unverified { .. } | VerificationMethod::Unchecked => {
                    acc.unverified += 1;
                }
            }
            acc
        })
    }

    /// Returns the number of verified citations.
    #[must_use]
    pub fn verified(&self) -> usize {
        self.exact + self.partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CitationLocation;
    use pretty_assertions::assert_eq;

    const SOURCE: &str = "Once upon a time the quick brown fox jumps over the lazy dog.\n\
        Safety  procedures must be followed at all times in the warehouse.";

    #[test]
    fn test_normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize("  The\tQuick \n\n Brown "), "the quick brown");
    }

    #[test]
    fn test_exact_match_ignores_whitespace_and_case() {
        assert_eq!(
            verify_snippet("THE QUICK\n brown   fox", SOURCE),
            VerificationMethod::Exact
        );
    }

    #[test]
    fn test_partial_match_in_order() {
        let method = verify_snippet(
            "safety procedures should be followed at all times",
            SOURCE,
        );

        match method {
            VerificationMethod::Partial { ratio } => assert!((ratio - 0.875).abs() < 1e-9),
            other => panic!("expected partial match, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_order_words_do_not_count() {
        let method = verify_snippet("dog lazy the over jumps fox", SOURCE);
        assert!(!method.is_verified());
    }

    #[test]
    fn test_below_threshold_is_unverified() {
        let method = verify_snippet("the fox wrote a symphony about quantum gravity", SOURCE);

        match method {
            VerificationMethod::Unverified { ratio } => assert!(ratio < PARTIAL_MATCH_THRESHOLD),
            other => panic!("expected unverified, got {other:?}"),
        }
    }

    #[test]
    fn test_short_snippets_use_word_ratio() {
        assert_eq!(verify_snippet("lazy dog", SOURCE), VerificationMethod::Exact);
        assert_eq!(
            verify_snippet("lazy, dog!", SOURCE),
            VerificationMethod::Partial { ratio: 1.0 }
        );
        assert!(!verify_snippet("dog fox", SOURCE).is_verified());
    }

    #[test]
    fn test_empty_snippet_is_unverified() {
        assert!(!verify_snippet("   ", SOURCE).is_verified());
    }

    #[test]
    fn test_verify_keeps_unverified_citations() {
        let citations = vec![
            Citation::new("the quick brown fox", CitationLocation::Beginning).ranked(0),
            Citation::new("totally fabricated quote", CitationLocation::Middle).ranked(1),
        ];

        let verified = verify(citations, "...the quick brown fox jumps...");

        assert_eq!(verified.len(), 2);
        assert!(verified[0].verified);
        assert_eq!(verified[0].verification, VerificationMethod::Exact);
        assert!(!verified[1].verified);
        assert_eq!(verified[1].snippet, "totally fabricated quote");

        let summary = VerificationSummary::of(&verified);
        assert_eq!(
            summary,
            VerificationSummary {
                total: 2,
                exact: 1,
                partial: 0,
                unverified: 1,
            }
        );
        assert_eq!(summary.verified(), 1);
    }

    #[test]
    fn test_verify_is_deterministic() {
        let batch = || {
            vec![
                Citation::new("must be followed at all times", CitationLocation::End),
                Citation::new("procedures must follow all times warehouse", CitationLocation::End),
            ]
        };

        assert_eq!(verify(batch(), SOURCE), verify(batch(), SOURCE));
    }

    #[test]
    fn test_common_subsequence_len() {
        assert_eq!(common_subsequence_len(&["a", "b", "c"], &["a", "x", "c", "b"]), 2);
        assert_eq!(common_subsequence_len(&["a"], &[]), 0);
        assert_eq!(common_subsequence_len(&["a", "b"], &["a", "b"]), 2);
    }
}
