//! Citation verification.
//!
//! The verifier checks generated snippets against the source text. It never
//! invents or drops citations and never logs; callers decide what to do with
//! unverified ones.

mod verifier;

pub use verifier::{
    normalize, verify, verify_snippet, SourceIndex, VerificationSummary, PARTIAL_MATCH_THRESHOLD,
};
