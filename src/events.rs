use crate::types::ThreadId;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadsEvent {
    /// Any change to the thread collection or the current thread selection.
    CurrentThreadChanged,
    StreamStateChanged { thread_id: ThreadId },
}

type Listener = Arc<dyn Fn(&ThreadsEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    listeners: Vec<Listener>,
    channels: Vec<mpsc::UnboundedSender<ThreadsEvent>>,
}

/// Synchronous, ordered fan-out of [`ThreadsEvent`]s.
///
/// Listeners run inline on the emitting task, in registration order, outside
/// the bus lock so they may emit in turn. Channel subscribers get the same
/// sequence; closed channels are dropped on the next emit.
#[derive(Clone, Default)]
pub struct ChangeBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&ThreadsEvent) + Send + Sync + 'static) {
        self.lock().listeners.push(Arc::new(listener));
    }

    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<ThreadsEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().channels.push(tx);
        rx
    }

    pub fn emit(&self, event: ThreadsEvent) {
        let listeners = {
            let mut subscribers = self.lock();
            subscribers
                .channels
                .retain(|tx| tx.send(event.clone()).is_ok());
            subscribers.listeners.clone()
        };
        for listener in listeners {
            listener(&event);
        }
    }

    pub fn current_thread_changed(&self) {
        self.emit(ThreadsEvent::CurrentThreadChanged);
    }

    pub fn stream_state_changed(&self, thread_id: &str) {
        self.emit(ThreadsEvent::StreamStateChanged {
            thread_id: thread_id.to_string(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listeners_receive_events_in_order() {
        let bus = ChangeBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

        bus.current_thread_changed();
        bus.stream_state_changed("t1");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ThreadsEvent::CurrentThreadChanged,
                ThreadsEvent::StreamStateChanged {
                    thread_id: "t1".into()
                },
            ]
        );
    }

    #[test]
    fn test_closed_channels_are_pruned() {
        let bus = ChangeBus::new();
        let rx = bus.subscribe_channel();
        drop(rx);
        let mut live = bus.subscribe_channel();

        bus.current_thread_changed();
        assert_eq!(live.try_recv().unwrap(), ThreadsEvent::CurrentThreadChanged);
        assert_eq!(bus.lock().channels.len(), 1);
    }
}
