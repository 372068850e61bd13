use super::migration::{migrate, CURRENT_VERSION, THREAD_STORAGE_KEY, THREAD_VERSION_KEY};
use crate::events::ChangeBus;
use crate::storage::{KeyValueStorage, StorageError, StorageScope, StorageTarget};
use crate::types::{
    ChatMessage, ChatThread, Selection, ThreadId, ThreadMap, ThreadState, ThreadsState,
    UserMessageState,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to serialize threads: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("thread not found: {0}")]
    ThreadNotFound(ThreadId),
    #[error("thread {thread_id} has no message at index {index}")]
    MessageOutOfRange { thread_id: ThreadId, index: usize },
    #[error("message {index} in thread {thread_id} is not a user message")]
    NotAUserMessage { thread_id: ThreadId, index: usize },
}

/// Partial update of [`ThreadState`]; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ThreadStatePatch {
    pub staging_selections: Option<Vec<Selection>>,
    pub focused_message_idx: Option<Option<usize>>,
    pub is_checked_of_selection_id: Option<HashMap<String, bool>>,
}

impl ThreadStatePatch {
    fn apply(self, state: &mut ThreadState) {
        if let Some(selections) = self.staging_selections {
            state.staging_selections = selections;
        }
        if let Some(idx) = self.focused_message_idx {
            state.focused_message_idx = idx;
        }
        if let Some(checked) = self.is_checked_of_selection_id {
            state.is_checked_of_selection_id = checked;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UserMessageStatePatch {
    pub staging_selections: Option<Vec<Selection>>,
    pub is_being_edited: Option<bool>,
}

impl UserMessageStatePatch {
    fn apply(self, state: &mut UserMessageState) {
        if let Some(selections) = self.staging_selections {
            state.staging_selections = selections;
        }
        if let Some(editing) = self.is_being_edited {
            state.is_being_edited = editing;
        }
    }
}

/// Durable collection of chat threads.
///
/// Readers get an `Arc<ThreadsState>` snapshot. Every mutation clones the
/// snapshot, edits the clone, persists it and only then swaps it in, so the
/// stored document and the in-memory state never disagree.
///
/// If writing a migrated document fails on load, the migrated map is still
/// used and the version marker is written with the next successful persist.
pub struct ThreadStore {
    storage: Arc<dyn KeyValueStorage>,
    state: Mutex<Arc<ThreadsState>>,
    bus: ChangeBus,
    version_pending: AtomicBool,
}

impl ThreadStore {
    /// Loads (and migrates) the stored threads, then makes sure an empty
    /// thread is current.
    pub fn open(storage: Arc<dyn KeyValueStorage>, bus: ChangeBus) -> Result<Self, StoreError> {
        let (all_threads, version_pending) = load_tracked(storage.as_ref());
        let store = Self {
            storage,
            state: Mutex::new(Arc::new(ThreadsState {
                all_threads,
                current_thread_id: ThreadId::new(),
            })),
            bus,
            version_pending: AtomicBool::new(version_pending),
        };
        store.open_new_thread()?;
        Ok(store)
    }

    /// Reads the stored thread map. Missing or malformed data yields an empty
    /// map; a migrated document is written back before returning.
    pub fn load(storage: &dyn KeyValueStorage) -> ThreadMap {
        load_tracked(storage).0
    }

    pub fn snapshot(&self) -> Arc<ThreadsState> {
        Arc::clone(&self.lock())
    }

    pub fn current_thread_id(&self) -> ThreadId {
        self.lock().current_thread_id.clone()
    }

    pub fn current_thread(&self) -> Option<ChatThread> {
        self.lock().current_thread().cloned()
    }

    pub fn thread(&self, thread_id: &str) -> Option<ChatThread> {
        self.lock().all_threads.get(thread_id).cloned()
    }

    /// Switches to an existing empty thread, or creates one.
    pub fn open_new_thread(&self) -> Result<ThreadId, StoreError> {
        let snapshot = self.snapshot();
        let reusable = snapshot
            .threads_by_recency()
            .into_iter()
            .find(|thread| thread.is_empty())
            .map(|thread| thread.id.clone());
        if let Some(thread_id) = reusable {
            self.switch_to_thread(&thread_id);
            return Ok(thread_id);
        }

        let now = Utc::now();
        let mut created = ThreadId::new();
        self.update(|state| {
            let thread_id = new_thread_id(now, &state.all_threads);
            state
                .all_threads
                .insert(thread_id.clone(), ChatThread::new(thread_id.clone(), now));
            state.current_thread_id = thread_id.clone();
            created = thread_id;
            Ok(())
        })?;
        tracing::debug!(thread_id = %created, "created thread");
        Ok(created)
    }

    /// Precondition: `thread_id` names an existing thread. It is not checked;
    /// lookups through [`Self::current_thread`] simply return `None` otherwise.
    pub fn switch_to_thread(&self, thread_id: &str) {
        {
            let mut guard = self.lock();
            let mut next = ThreadsState::clone(&guard);
            next.current_thread_id = thread_id.to_string();
            *guard = Arc::new(next);
        }
        self.bus.current_thread_changed();
    }

    pub fn append_message(&self, thread_id: &str, message: ChatMessage) -> Result<(), StoreError> {
        self.update_thread(thread_id, |thread| {
            thread.messages.push(message);
            thread.last_modified = bump(thread.last_modified);
            Ok(())
        })
    }

    /// Keeps `messages[..len]`.
    pub fn truncate_messages(&self, thread_id: &str, len: usize) -> Result<(), StoreError> {
        self.update_thread(thread_id, |thread| {
            thread.messages.truncate(len);
            if thread
                .state
                .focused_message_idx
                .is_some_and(|idx| idx >= len)
            {
                thread.state.focused_message_idx = None;
            }
            thread.last_modified = bump(thread.last_modified);
            Ok(())
        })
    }

    pub fn set_focused_message_idx(
        &self,
        thread_id: &str,
        idx: Option<usize>,
    ) -> Result<(), StoreError> {
        self.set_thread_state(
            thread_id,
            ThreadStatePatch {
                focused_message_idx: Some(idx),
                ..Default::default()
            },
        )
    }

    pub fn set_thread_state(
        &self,
        thread_id: &str,
        patch: ThreadStatePatch,
    ) -> Result<(), StoreError> {
        self.update_thread(thread_id, |thread| {
            patch.apply(&mut thread.state);
            Ok(())
        })
    }

    pub fn add_staging_selection(
        &self,
        thread_id: &str,
        selection: Selection,
    ) -> Result<(), StoreError> {
        self.update_thread(thread_id, |thread| {
            if !thread.state.staging_selections.contains(&selection) {
                thread
                    .state
                    .is_checked_of_selection_id
                    .insert(selection.id(), true);
                thread.state.staging_selections.push(selection);
            }
            Ok(())
        })
    }

    pub fn clear_staging_selections(&self, thread_id: &str) -> Result<(), StoreError> {
        self.set_thread_state(
            thread_id,
            ThreadStatePatch {
                staging_selections: Some(Vec::new()),
                is_checked_of_selection_id: Some(HashMap::new()),
                ..Default::default()
            },
        )
    }

    pub fn set_message_state(
        &self,
        thread_id: &str,
        index: usize,
        patch: UserMessageStatePatch,
    ) -> Result<(), StoreError> {
        self.update_thread(thread_id, |thread| {
            let message = thread
                .messages
                .get_mut(index)
                .ok_or_else(|| StoreError::MessageOutOfRange {
                    thread_id: thread_id.to_string(),
                    index,
                })?;
            match message {
                ChatMessage::User { state, .. } => {
                    patch.apply(state);
                    Ok(())
                }
                _ => Err(StoreError::NotAUserMessage {
                    thread_id: thread_id.to_string(),
                    index,
                }),
            }
        })
    }

    fn update_thread(
        &self,
        thread_id: &str,
        edit: impl FnOnce(&mut ChatThread) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.update(|state| {
            let thread = state
                .all_threads
                .get_mut(thread_id)
                .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
            edit(thread)
        })
    }

    fn update(
        &self,
        edit: impl FnOnce(&mut ThreadsState) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        {
            let mut guard = self.lock();
            let mut next = ThreadsState::clone(&guard);
            edit(&mut next)?;
            self.persist(&next.all_threads)?;
            *guard = Arc::new(next);
        }
        self.bus.current_thread_changed();
        Ok(())
    }

    fn persist(&self, threads: &ThreadMap) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(threads)?;
        self.storage.store(
            THREAD_STORAGE_KEY,
            &serialized,
            StorageScope::Application,
            StorageTarget::User,
        )?;
        if self.version_pending.load(Ordering::Acquire) {
            self.storage.store(
                THREAD_VERSION_KEY,
                CURRENT_VERSION,
                StorageScope::Application,
                StorageTarget::User,
            )?;
            self.version_pending.store(false, Ordering::Release);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Arc<ThreadsState>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Like [`ThreadStore::load`]; the flag is set when the migrated document
/// could not be written back.
fn load_tracked(storage: &dyn KeyValueStorage) -> (ThreadMap, bool) {
    let version = storage.get(THREAD_VERSION_KEY, StorageScope::Application);
    let raw = storage.get(THREAD_STORAGE_KEY, StorageScope::Application);

    let document = match raw.as_deref().map(serde_json::from_str::<Value>) {
        Some(Ok(document)) => document,
        Some(Err(err)) => {
            tracing::warn!(error = %err, "stored threads are not valid JSON; starting empty");
            Value::Object(Default::default())
        }
        None => Value::Object(Default::default()),
    };

    let mut write_failed = false;
    let document = match migrate(&document, version.as_deref()) {
        Some(migrated) => {
            tracing::info!(
                from = version.as_deref().unwrap_or("<none>"),
                to = CURRENT_VERSION,
                "migrating stored threads"
            );
            if let Err(err) = write_migrated(storage, &migrated) {
                tracing::error!(error = %err, "failed to persist migrated threads");
                write_failed = true;
            }
            migrated
        }
        None => document,
    };

    let threads = serde_json::from_value(document).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "stored threads do not match the current schema; starting empty");
        ThreadMap::new()
    });
    (threads, write_failed)
}

fn write_migrated(storage: &dyn KeyValueStorage, migrated: &Value) -> Result<(), StoreError> {
    storage.store(
        THREAD_STORAGE_KEY,
        &serde_json::to_string(migrated)?,
        StorageScope::Application,
        StorageTarget::User,
    )?;
    storage.store(
        THREAD_VERSION_KEY,
        CURRENT_VERSION,
        StorageScope::Application,
        StorageTarget::User,
    )?;
    Ok(())
}

fn new_thread_id(now: DateTime<Utc>, existing: &ThreadMap) -> ThreadId {
    let base = now.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string();
    if !existing.contains_key(&base) {
        return base;
    }
    (1..)
        .map(|n| format!("{base}-{n}"))
        .find(|candidate| !existing.contains_key(candidate))
        .unwrap_or(base)
}

fn bump(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous)
}
