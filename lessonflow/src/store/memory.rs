//! In-memory document store.

use super::{DocumentStore, INITIAL_VERSION};
use crate::core::{Document, DocumentId, VersionedDocument};
use crate::errors::PipelineError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// A [`DocumentStore`] backed by a concurrent map.
///
/// Each entry is locked for the duration of a compare-and-store, so the
/// version check and the write are atomic.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: DashMap<DocumentId, VersionedDocument>,
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert(&self, document: &Document) -> Result<u64, PipelineError> {
        match self.documents.entry(document.id) {
            Entry::Occupied(_) => Err(PipelineError::DocumentExists(document.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(VersionedDocument {
                    document: document.clone(),
                    version: INITIAL_VERSION,
                });
                Ok(INITIAL_VERSION)
            }
        }
    }

    async fn load(&self, id: &DocumentId) -> Result<VersionedDocument, PipelineError> {
        self.documents
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PipelineError::DocumentNotFound(id.to_string()))
    }

    async fn compare_and_store(
        &self,
        document: &Document,
        expected_version: u64,
    ) -> Result<u64, PipelineError> {
        let mut entry = self
            .documents
            .get_mut(&document.id)
            .ok_or_else(|| PipelineError::DocumentNotFound(document.id.to_string()))?;

        if entry.version != expected_version {
            return Err(PipelineError::VersionConflict {
                document_id: document.id.to_string(),
                expected: expected_version,
                actual: entry.version,
            });
        }

        entry.version += 1;
        entry.document = document.clone();
        Ok(entry.version)
    }

    async fn delete(&self, id: &DocumentId) -> Result<(), PipelineError> {
        self.documents
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| PipelineError::DocumentNotFound(id.to_string()))
    }

    async fn list_ids(&self) -> Result<Vec<DocumentId>, PipelineError> {
        let mut ids: Vec<DocumentId> = self.documents.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        Ok(ids)
    }
}
