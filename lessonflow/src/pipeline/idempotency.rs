//! Idempotency keys for step invocations.
//!
//! Keys are opaque strings chosen by the caller. The engine records the key
//! that completed each step and compares later requests against it.

use crate::core::{DocumentId, StepName};
use sha2::{Digest, Sha256};

/// How a supplied key relates to the key recorded for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatch {
    /// Same key: the request is a replay.
    Same,
    /// A different key was recorded.
    Different,
    /// No key recorded yet.
    Unrecorded,
}

impl KeyMatch {
    /// Compares a supplied key with the recorded one.
    #[must_use]
    pub fn compare(recorded: Option<&str>, supplied: &str) -> Self {
        match recorded {
            Some(recorded) if recorded == supplied => Self::Same,
            Some(_) => Self::Different,
            None => Self::Unrecorded,
        }
    }
}

/// Derives a deterministic key from its components.
///
/// Format: `idem:` followed by the first 16 bytes of the SHA-256 of the
/// `:`-joined components, hex encoded.
#[must_use]
pub fn derive_idempotency_key(components: &[&str]) -> String {
    let combined = components.join(":");
    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    let result = hasher.finalize();
    format!("idem:{}", hex::encode(&result[..16]))
}

/// Derives the key for one request of a step on a document.
///
/// Callers retrying the same request pass the same `request_id`.
#[must_use]
pub fn step_idempotency_key(document_id: &DocumentId, step: StepName, request_id: &str) -> String {
    derive_idempotency_key(&[&document_id.to_string(), step.as_str(), request_id])
}
