//! JSON file document store.

use super::{DocumentStore, INITIAL_VERSION};
use crate::core::{Document, DocumentId, VersionedDocument};
use crate::errors::PipelineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Serialize, Deserialize)]
struct StoredDocument {
    version: u64,
    document: Document,
}

/// A [`DocumentStore`] keeping one `<id>.json` file per document.
///
/// Writes go to a temporary file that is then renamed over the target, so a
/// reader never sees a half-written document. Writers within one process are
/// serialized; the store is not meant to be shared between processes.
#[derive(Debug)]
pub struct JsonFileDocumentStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileDocumentStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the directory holding the documents.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &DocumentId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    async fn read(&self, id: &DocumentId) -> Result<StoredDocument, PipelineError> {
        let bytes = match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(PipelineError::DocumentNotFound(id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let stored: StoredDocument = serde_json::from_slice(&bytes).map_err(|err| {
            PipelineError::CorruptState(format!("file for document {id} is unreadable: {err}"))
        })?;
        if stored.document.id != *id {
            return Err(PipelineError::CorruptState(format!(
                "file for document {id} holds document {}",
                stored.document.id
            )));
        }
        Ok(stored)
    }

    async fn write(&self, stored: &StoredDocument) -> Result<(), PipelineError> {
        let path = self.path_for(&stored.document.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(stored)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(
            document_id = %stored.document.id,
            version = stored.version,
            "Wrote document"
        );
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for JsonFileDocumentStore {
    async fn insert(&self, document: &Document) -> Result<u64, PipelineError> {
        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(self.path_for(&document.id)).await? {
            return Err(PipelineError::DocumentExists(document.id.to_string()));
        }
        self.write(&StoredDocument {
            version: INITIAL_VERSION,
            document: document.clone(),
        })
        .await?;
        Ok(INITIAL_VERSION)
    }

    async fn load(&self, id: &DocumentId) -> Result<VersionedDocument, PipelineError> {
        let stored = self.read(id).await?;
        Ok(VersionedDocument {
            document: stored.document,
            version: stored.version,
        })
    }

    async fn compare_and_store(
        &self,
        document: &Document,
        expected_version: u64,
    ) -> Result<u64, PipelineError> {
        let _guard = self.write_lock.lock().await;
        let current = self.read(&document.id).await?;
        if current.version != expected_version {
            return Err(PipelineError::VersionConflict {
                document_id: document.id.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let version = current.version + 1;
        self.write(&StoredDocument {
            version,
            document: document.clone(),
        })
        .await?;
        Ok(version)
    }

    async fn delete(&self, id: &DocumentId) -> Result<(), PipelineError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(PipelineError::DocumentNotFound(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list_ids(&self) -> Result<Vec<DocumentId>, PipelineError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(id) = stem.parse::<DocumentId>() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FileRef, FileType, StepName, StepStatus};
    use pretty_assertions::assert_eq;

    fn document() -> Document {
        Document::new("Notes", FileRef::new("notes.docx", FileType::Docx), StepName::ALL)
    }

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileDocumentStore::open(dir.path()).await.unwrap();
        let mut doc = document();
        doc.step_statuses
            .transition(StepName::ExtractText, StepStatus::InProgress)
            .unwrap();

        store.insert(&doc).await.unwrap();
        let loaded = store.load(&doc.id).await.unwrap();

        assert_eq!(loaded.version, INITIAL_VERSION);
        assert_eq!(loaded.document, doc);
        assert_eq!(store.list_ids().await.unwrap(), vec![doc.id]);
    }

    #[tokio::test]
    async fn test_version_check_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document();
        {
            let store = JsonFileDocumentStore::open(dir.path()).await.unwrap();
            store.insert(&doc).await.unwrap();
            doc.retry_count = 2;
            assert_eq!(store.compare_and_store(&doc, 1).await.unwrap(), 2);
            assert!(matches!(
                store.compare_and_store(&doc, 1).await,
                Err(PipelineError::VersionConflict { .. })
            ));
        }

        let reopened = JsonFileDocumentStore::open(dir.path()).await.unwrap();
        let loaded = reopened.load(&doc.id).await.unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.document.retry_count, 2);
    }

    #[tokio::test]
    async fn test_delete_and_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileDocumentStore::open(dir.path()).await.unwrap();
        let doc = document();
        store.insert(&doc).await.unwrap();

        store.delete(&doc.id).await.unwrap();

        assert!(matches!(
            store.load(&doc.id).await,
            Err(PipelineError::DocumentNotFound(_))
        ));
        assert!(store.list_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileDocumentStore::open(dir.path()).await.unwrap();
        let id = DocumentId::new();
        tokio::fs::write(dir.path().join(format!("{id}.json")), b"{not json")
            .await
            .unwrap();

        assert!(matches!(
            store.load(&id).await,
            Err(PipelineError::CorruptState(_))
        ));
    }
}
