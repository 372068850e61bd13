//! Key/value persistence used by the thread store.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScope {
    Application,
    Workspace,
}

impl StorageScope {
    fn file_stem(self) -> &'static str {
        match self {
            StorageScope::Application => "application",
            StorageScope::Workspace => "workspace",
        }
    }
}

/// Whether a value should survive as user data or may be treated as
/// machine-local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTarget {
    User,
    Machine,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("storage document is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str, scope: StorageScope) -> Option<String>;

    fn store(
        &self,
        key: &str,
        value: &str,
        scope: StorageScope,
        target: StorageTarget,
    ) -> Result<(), StorageError>;
}
