//! Document state persistence.
//!
//! The engine reads a document with its version and writes it back with
//! [`DocumentStore::compare_and_store`]. A write based on a stale read fails
//! with [`PipelineError::VersionConflict`] and nothing is written.

mod file;
mod memory;

pub use file::JsonFileDocumentStore;
pub use memory::InMemoryDocumentStore;

use crate::core::{Document, DocumentId, VersionedDocument};
use crate::errors::PipelineError;
use async_trait::async_trait;

/// Version assigned to a freshly inserted document.
pub const INITIAL_VERSION: u64 = 1;

/// Persistence contract for document aggregates.
///
/// A document and everything stored in its step records is one unit: it is
/// written, read and deleted as a whole.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Stores a new document at [`INITIAL_VERSION`].
    ///
    /// # Errors
    ///
    /// [`PipelineError::DocumentExists`] if the id is taken.
    async fn insert(&self, document: &Document) -> Result<u64, PipelineError>;

    /// Loads a document and its current version.
    ///
    /// # Errors
    ///
    /// [`PipelineError::DocumentNotFound`] if there is no such document.
    async fn load(&self, id: &DocumentId) -> Result<VersionedDocument, PipelineError>;

    /// Replaces the document if its stored version equals `expected_version`.
    ///
    /// Returns the new version.
    ///
    /// # Errors
    ///
    /// [`PipelineError::VersionConflict`] if the version moved on, or
    /// [`PipelineError::DocumentNotFound`] if the document is gone.
    async fn compare_and_store(
        &self,
        document: &Document,
        expected_version: u64,
    ) -> Result<u64, PipelineError>;

    /// Deletes a document with all of its artifacts.
    ///
    /// # Errors
    ///
    /// [`PipelineError::DocumentNotFound`] if there is no such document.
    async fn delete(&self, id: &DocumentId) -> Result<(), PipelineError>;

    /// Lists stored document ids.
    async fn list_ids(&self) -> Result<Vec<DocumentId>, PipelineError>;
}
