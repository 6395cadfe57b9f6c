//! On-disk storage for local replicas.
//!
//! Lets a client keep editing across restarts while offline. Each document
//! is stored as `<doc_id>.automerge` in the data directory:
//!
//! ```text
//! ~/.local/share/docsync/
//! ├── notes-2024.automerge
//! └── 3vQB7B6MrGQZaxCuFg4oh.automerge
//! ```

use std::fs;
use std::io;
use std::path::PathBuf;

use crate::document_id::DocumentId;
use crate::snapshot::EncodedSnapshot;

/// File extension for stored replicas.
const DOC_EXTENSION: &str = "automerge";

/// Errors that can occur during local storage operations.
#[derive(Debug)]
pub enum LocalStorageError {
    /// I/O error reading or writing a file.
    IoError(PathBuf, io::Error),
}

impl std::fmt::Display for LocalStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalStorageError::IoError(path, e) => {
                write!(f, "I/O error for {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for LocalStorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LocalStorageError::IoError(_, e) => Some(e),
        }
    }
}

/// Stores replica snapshots by document id.
#[derive(Clone, Debug)]
pub struct LocalDocStorage {
    data_dir: PathBuf,
}

impl LocalDocStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Returns the full path for a document.
    pub fn doc_path(&self, doc_id: &DocumentId) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", doc_id.as_str(), DOC_EXTENSION))
    }

    pub fn exists(&self, doc_id: &DocumentId) -> bool {
        self.doc_path(doc_id).exists()
    }

    /// Loads a stored snapshot.
    ///
    /// Returns `Ok(None)` if the file doesn't exist.
    pub fn load(&self, doc_id: &DocumentId) -> Result<Option<EncodedSnapshot>, LocalStorageError> {
        let path = self.doc_path(doc_id);

        match fs::read(&path) {
            Ok(bytes) => Ok(Some(EncodedSnapshot::new(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LocalStorageError::IoError(path, e)),
        }
    }

    /// Saves a snapshot, replacing any previous one.
    ///
    /// Writes to a temp file and renames it into place so a crash never
    /// leaves a truncated replica behind.
    pub fn save(
        &self,
        doc_id: &DocumentId,
        snapshot: &EncodedSnapshot,
    ) -> Result<(), LocalStorageError> {
        fs::create_dir_all(&self.data_dir)
            .map_err(|e| LocalStorageError::IoError(self.data_dir.clone(), e))?;

        let path = self.doc_path(doc_id);
        let temp_path = path.with_extension("automerge.tmp");

        fs::write(&temp_path, snapshot.as_bytes())
            .map_err(|e| LocalStorageError::IoError(temp_path.clone(), e))?;

        fs::rename(&temp_path, &path).map_err(|e| LocalStorageError::IoError(path, e))?;

        Ok(())
    }

    /// Deletes a stored replica.
    ///
    /// Returns `Ok(true)` if the file was deleted, `Ok(false)` if it didn't exist.
    pub fn delete(&self, doc_id: &DocumentId) -> Result<bool, LocalStorageError> {
        let path = self.doc_path(doc_id);

        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LocalStorageError::IoError(path, e)),
        }
    }

    /// Lists all document ids stored in the data directory.
    pub fn list(&self) -> Result<Vec<DocumentId>, LocalStorageError> {
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LocalStorageError::IoError(self.data_dir.clone(), e)),
        };

        let mut doc_ids = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|e| LocalStorageError::IoError(self.data_dir.clone(), e))?;
            let path = entry.path();

            if !path.is_file() {
                continue;
            }

            if path.extension().and_then(|s| s.to_str()) != Some(DOC_EXTENSION) {
                continue;
            }

            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(doc_id) = DocumentId::parse(stem) {
                    doc_ids.push(doc_id);
                }
            }
        }

        doc_ids.sort();
        Ok(doc_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_storage() -> (LocalDocStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalDocStorage::new(temp_dir.path());
        (storage, temp_dir)
    }

    fn doc(id: &str) -> DocumentId {
        DocumentId::parse(id).unwrap()
    }

    #[test]
    fn test_load_nonexistent_returns_none() {
        let (storage, _temp) = test_storage();
        assert!(storage.load(&doc("missing")).unwrap().is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (storage, _temp) = test_storage();
        let snapshot = EncodedSnapshot::new(vec![1, 2, 3]);

        storage.save(&doc("notes"), &snapshot).unwrap();

        assert!(storage.exists(&doc("notes")));
        assert_eq!(storage.load(&doc("notes")).unwrap(), Some(snapshot));
    }

    #[test]
    fn test_save_creates_directory_and_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("nested").join("data");
        let storage = LocalDocStorage::new(nested.clone());

        storage
            .save(&doc("notes"), &EncodedSnapshot::new(vec![9]))
            .unwrap();

        assert!(nested.join("notes.automerge").exists());
        assert!(!nested.join("notes.automerge.tmp").exists());
    }

    #[test]
    fn test_delete() {
        let (storage, _temp) = test_storage();
        storage
            .save(&doc("notes"), &EncodedSnapshot::new(vec![1]))
            .unwrap();

        assert!(storage.delete(&doc("notes")).unwrap());
        assert!(!storage.delete(&doc("notes")).unwrap());
    }

    #[test]
    fn test_list_skips_foreign_files() {
        let (storage, temp) = test_storage();
        storage.save(&doc("b"), &EncodedSnapshot::new(vec![1])).unwrap();
        storage.save(&doc("a"), &EncodedSnapshot::new(vec![1])).unwrap();
        fs::write(temp.path().join("readme.txt"), "hi").unwrap();

        assert_eq!(storage.list().unwrap(), vec![doc("a"), doc("b")]);
    }
}
