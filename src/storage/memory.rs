use super::{KeyValueStorage, StorageError, StorageScope, StorageTarget};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<(StorageScope, String), String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<'a>(
        values: impl IntoIterator<Item = (&'a str, &'a str)>,
        scope: StorageScope,
    ) -> Self {
        let storage = Self::default();
        if let Ok(mut guard) = storage.values.lock() {
            for (key, value) in values {
                guard.insert((scope, key.to_string()), value.to_string());
            }
        }
        storage
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str, scope: StorageScope) -> Option<String> {
        let guard = self.values.lock().ok()?;
        guard.get(&(scope, key.to_string())).cloned()
    }

    fn store(
        &self,
        key: &str,
        value: &str,
        scope: StorageScope,
        _target: StorageTarget,
    ) -> Result<(), StorageError> {
        let mut guard = self
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert((scope, key.to_string()), value.to_string());
        Ok(())
    }
}
