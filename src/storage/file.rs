use super::{KeyValueStorage, StorageError, StorageScope, StorageTarget};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

type Document = BTreeMap<String, String>;

/// One JSON document per scope under `root`, rewritten atomically
/// (temp file, fsync, rename) on every store.
pub struct FileStorage {
    root: PathBuf,
    documents: Mutex<HashMap<StorageScope, Document>>,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            documents: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, scope: StorageScope) -> PathBuf {
        self.root.join(format!("{}.json", scope.file_stem()))
    }

    fn read_document(&self, scope: StorageScope) -> Document {
        let path = self.document_path(scope);
        let Ok(raw) = fs::read_to_string(&path) else {
            return Document::new();
        };
        if raw.trim().is_empty() {
            return Document::new();
        }
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable storage document");
            Document::new()
        })
    }

    fn write_document(&self, scope: StorageScope, document: &Document) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;
        let path = self.document_path(scope);
        let tmp_path = path.with_extension("json.tmp");
        let serialized = serde_json::to_string_pretty(document)?;

        let mut tmp_file = File::create(&tmp_path).map_err(io_err(&tmp_path))?;
        tmp_file
            .write_all(serialized.as_bytes())
            .map_err(io_err(&tmp_path))?;
        tmp_file.sync_all().map_err(io_err(&tmp_path))?;
        drop(tmp_file);

        fs::rename(&tmp_path, &path).map_err(io_err(&path))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError {
    let path = path.display().to_string();
    move |source| StorageError::Io { path, source }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str, scope: StorageScope) -> Option<String> {
        let mut documents = self
            .documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        documents
            .entry(scope)
            .or_insert_with(|| self.read_document(scope))
            .get(key)
            .cloned()
    }

    fn store(
        &self,
        key: &str,
        value: &str,
        scope: StorageScope,
        _target: StorageTarget,
    ) -> Result<(), StorageError> {
        let mut documents = self
            .documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = documents
            .entry(scope)
            .or_insert_with(|| self.read_document(scope));

        let mut next = current.clone();
        next.insert(key.to_string(), value.to_string());
        self.write_document(scope, &next)?;
        *current = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_values_survive_reopen() {
        let temp = TempDir::new().expect("temp dir");
        let storage = FileStorage::new(temp.path());
        storage
            .store("a", "1", StorageScope::Application, StorageTarget::User)
            .unwrap();
        storage
            .store("b", "2", StorageScope::Application, StorageTarget::User)
            .unwrap();

        let reopened = FileStorage::new(temp.path());
        assert_eq!(
            reopened.get("a", StorageScope::Application).as_deref(),
            Some("1")
        );
        assert_eq!(
            reopened.get("b", StorageScope::Application).as_deref(),
            Some("2")
        );
        assert!(!temp.path().join("application.json.tmp").exists());
    }

    #[test]
    fn test_malformed_document_reads_as_empty() {
        let temp = TempDir::new().expect("temp dir");
        fs::write(temp.path().join("application.json"), "{not json").unwrap();
        let storage = FileStorage::new(temp.path());
        assert_eq!(storage.get("a", StorageScope::Application), None);

        storage
            .store("a", "1", StorageScope::Application, StorageTarget::User)
            .unwrap();
        assert_eq!(
            FileStorage::new(temp.path())
                .get("a", StorageScope::Application)
                .as_deref(),
            Some("1")
        );
    }
}
