use crate::events::ChangeBus;
use crate::types::ThreadId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub message: String,
    pub full_error: Option<String>,
}

impl StreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            full_error: None,
        }
    }

    /// Keeps the top-level message and the whole `anyhow`-style cause chain.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = vec![error.to_string()];
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            full_error: (chain.len() > 1).then(|| chain.join(": ")),
        }
    }
}

/// Identifies one model request so stale callbacks can be told apart from the
/// request currently tracked for a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(u64);

#[derive(Debug, Clone, Default)]
pub struct ThreadStreamState {
    pub error: Option<StreamError>,
    pub message_so_far: Option<String>,
    pub streaming_token: Option<CancellationToken>,
    request: Option<RequestId>,
}

impl ThreadStreamState {
    pub fn is_streaming(&self) -> bool {
        self.streaming_token.is_some()
    }

    fn is_idle(&self) -> bool {
        self.error.is_none() && self.message_so_far.is_none() && self.streaming_token.is_none()
    }
}

#[derive(Default)]
struct Entries {
    by_thread: HashMap<ThreadId, ThreadStreamState>,
    next_request: u64,
}

/// Transient, never persisted, per-thread state of in-flight responses.
///
/// A thread has an entry only while a request is in flight or an error is
/// waiting to be dismissed.
pub struct StreamStateTracker {
    entries: Mutex<Entries>,
    bus: ChangeBus,
}

impl StreamStateTracker {
    pub fn new(bus: ChangeBus) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            bus,
        }
    }

    pub fn get(&self, thread_id: &str) -> Option<ThreadStreamState> {
        self.lock().by_thread.get(thread_id).cloned()
    }

    pub fn begin_request(&self, thread_id: &str, token: CancellationToken) -> RequestId {
        let request = {
            let mut entries = self.lock();
            entries.next_request += 1;
            let request = RequestId(entries.next_request);
            entries.by_thread.insert(
                thread_id.to_string(),
                ThreadStreamState {
                    error: None,
                    message_so_far: Some(String::new()),
                    streaming_token: Some(token),
                    request: Some(request),
                },
            );
            request
        };
        self.bus.stream_state_changed(thread_id);
        request
    }

    /// Appends a delta; ignored once `request` is no longer the tracked one.
    pub fn append_text(&self, thread_id: &str, request: RequestId, delta: &str) -> bool {
        let applied = {
            let mut entries = self.lock();
            match entries.by_thread.get_mut(thread_id) {
                Some(entry) if entry.request == Some(request) => {
                    entry
                        .message_so_far
                        .get_or_insert_with(String::new)
                        .push_str(delta);
                    true
                }
                _ => false,
            }
        };
        if applied {
            self.bus.stream_state_changed(thread_id);
        }
        applied
    }

    /// Ends `request`, recording `error` if given, and hands back the text
    /// accumulated so far. Returns `None` when the request was already
    /// finished, e.g. by a cancel.
    pub fn finish_request(
        &self,
        thread_id: &str,
        request: RequestId,
        error: Option<StreamError>,
    ) -> Option<String> {
        let text = {
            let mut entries = self.lock();
            let entry = entries.by_thread.get_mut(thread_id)?;
            if entry.request != Some(request) {
                return None;
            }
            let text = entry.message_so_far.take().unwrap_or_default();
            entry.streaming_token = None;
            entry.request = None;
            entry.error = error;
            if entry.is_idle() {
                entries.by_thread.remove(thread_id);
            }
            text
        };
        self.bus.stream_state_changed(thread_id);
        Some(text)
    }

    /// Aborts the tracked request, if any, and returns its partial text.
    pub fn cancel(&self, thread_id: &str) -> Option<String> {
        let text = {
            let mut entries = self.lock();
            let entry = entries.by_thread.get_mut(thread_id)?;
            let token = entry.streaming_token.take()?;
            token.cancel();
            let text = entry.message_so_far.take().unwrap_or_default();
            entry.request = None;
            if entry.is_idle() {
                entries.by_thread.remove(thread_id);
            }
            text
        };
        self.bus.stream_state_changed(thread_id);
        Some(text)
    }

    pub fn set_error(&self, thread_id: &str, error: StreamError) {
        {
            let mut entries = self.lock();
            let entry = entries.by_thread.entry(thread_id.to_string()).or_default();
            entry.error = Some(error);
            entry.message_so_far = None;
            entry.streaming_token = None;
            entry.request = None;
        }
        self.bus.stream_state_changed(thread_id);
    }

    pub fn dismiss_error(&self, thread_id: &str) {
        let changed = {
            let mut entries = self.lock();
            match entries.by_thread.get_mut(thread_id) {
                Some(entry) if entry.error.is_some() => {
                    entry.error = None;
                    if entry.is_idle() {
                        entries.by_thread.remove(thread_id);
                    }
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.bus.stream_state_changed(thread_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> StreamStateTracker {
        StreamStateTracker::new(ChangeBus::new())
    }

    #[test]
    fn test_request_lifecycle_removes_entry() {
        let tracker = tracker();
        let request = tracker.begin_request("t", CancellationToken::new());
        assert!(tracker.get("t").unwrap().is_streaming());

        assert!(tracker.append_text("t", request, "Hel"));
        assert!(tracker.append_text("t", request, "lo"));
        assert_eq!(
            tracker.get("t").unwrap().message_so_far.as_deref(),
            Some("Hello")
        );

        assert_eq!(
            tracker.finish_request("t", request, None).as_deref(),
            Some("Hello")
        );
        assert!(tracker.get("t").is_none());
    }

    #[test]
    fn test_cancel_aborts_and_finishes_once() {
        let tracker = tracker();
        let token = CancellationToken::new();
        let request = tracker.begin_request("t", token.clone());
        tracker.append_text("t", request, "partial");

        assert_eq!(tracker.cancel("t").as_deref(), Some("partial"));
        assert!(token.is_cancelled());
        assert!(tracker.get("t").is_none());

        assert_eq!(tracker.cancel("t"), None);
        assert_eq!(tracker.finish_request("t", request, None), None);
        assert!(!tracker.append_text("t", request, "late"));
    }

    #[test]
    fn test_error_persists_until_dismissed() {
        let tracker = tracker();
        let request = tracker.begin_request("t", CancellationToken::new());
        tracker.finish_request("t", request, Some(StreamError::new("boom")));

        let entry = tracker.get("t").unwrap();
        assert_eq!(entry.error.as_ref().map(|e| e.message.as_str()), Some("boom"));
        assert!(!entry.is_streaming());

        tracker.dismiss_error("t");
        assert!(tracker.get("t").is_none());
    }

    #[test]
    fn test_stale_request_is_ignored() {
        let tracker = tracker();
        let first = tracker.begin_request("t", CancellationToken::new());
        let second = tracker.begin_request("t", CancellationToken::new());
        assert!(!tracker.append_text("t", first, "old"));
        assert!(tracker.append_text("t", second, "new"));
    }

    #[test]
    fn test_stream_error_keeps_cause_chain() {
        let error = anyhow::anyhow!("connection reset").context("request failed");
        let stream_error = StreamError::from_error(&*error);
        assert_eq!(stream_error.message, "request failed");
        assert_eq!(
            stream_error.full_error.as_deref(),
            Some("request failed: connection reset")
        );
    }
}
