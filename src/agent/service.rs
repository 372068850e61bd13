use super::prompt;
use crate::api::{ModelRequest, ModelTransport, TransportError};
use crate::config::ChatMode;
use crate::events::{ChangeBus, ThreadsEvent};
use crate::state::{
    RequestId, StoreError, StreamError, StreamStateTracker, ThreadStore, ThreadStreamState,
};
use crate::storage::KeyValueStorage;
use crate::tools::{ToolRegistry, Workspace};
use crate::types::{ChatMessage, FinalMessage, Selection, ThreadId, ToolCall, TransportEvent};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("thread not found: {0}")]
    ThreadNotFound(ThreadId),
    #[error("thread {thread_id} has no message at index {index}")]
    MessageOutOfRange { thread_id: ThreadId, index: usize },
    #[error("message {index} in thread {thread_id} is not a user message")]
    NotAUserMessage { thread_id: ThreadId, index: usize },
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub chat_mode: ChatMode,
    /// Tool rounds allowed per turn before it is stopped with an error.
    pub max_tool_rounds: usize,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            chat_mode: ChatMode::Agent,
            max_tool_rounds: 24,
        }
    }
}

/// A running turn. Dropping it detaches the turn; it keeps running.
pub struct TurnHandle {
    thread_id: ThreadId,
    join: JoinHandle<()>,
}

impl TurnHandle {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Waits for the turn's loop to exit.
    pub async fn finished(self) {
        if let Err(err) = self.join.await {
            tracing::error!(thread_id = %self.thread_id, error = %err, "turn task failed");
        }
    }
}

struct Turn {
    id: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct Turns {
    by_thread: HashMap<ThreadId, Turn>,
    next_id: u64,
}

struct Inner {
    store: ThreadStore,
    streams: StreamStateTracker,
    transport: Arc<dyn ModelTransport>,
    tools: ToolRegistry,
    workspace: Arc<Workspace>,
    options: ChatOptions,
    bus: ChangeBus,
    turns: Mutex<Turns>,
}

enum Outcome {
    Final(FinalMessage),
    Failed(StreamError),
    Cancelled,
}

/// Drives agent turns for chat threads: sends the history, streams the reply
/// into the stream state, runs requested tools one at a time and loops until
/// the model answers without tool calls.
#[derive(Clone)]
pub struct ChatThreadService {
    inner: Arc<Inner>,
}

impl ChatThreadService {
    pub fn new(
        storage: Arc<dyn KeyValueStorage>,
        transport: Arc<dyn ModelTransport>,
        tools: ToolRegistry,
        workspace: Arc<Workspace>,
        options: ChatOptions,
    ) -> Result<Self, ChatError> {
        let bus = ChangeBus::new();
        let store = ThreadStore::open(storage, bus.clone())?;
        let streams = StreamStateTracker::new(bus.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                streams,
                transport,
                tools,
                workspace,
                options,
                bus,
                turns: Mutex::new(Turns::default()),
            }),
        })
    }

    pub fn store(&self) -> &ThreadStore {
        &self.inner.store
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.inner.bus
    }

    pub fn subscribe(&self, listener: impl Fn(&ThreadsEvent) + Send + Sync + 'static) {
        self.inner.bus.subscribe(listener);
    }

    pub fn stream_state(&self, thread_id: &str) -> Option<ThreadStreamState> {
        self.inner.streams.get(thread_id)
    }

    pub fn chat_mode(&self) -> ChatMode {
        self.inner.options.chat_mode
    }

    /// Sends `instructions` with the thread's staging selections attached and
    /// starts the agent loop. Returns once the user message is stored.
    pub fn add_user_message_and_stream_response(
        &self,
        thread_id: &str,
        instructions: &str,
    ) -> Result<TurnHandle, ChatError> {
        let thread = self
            .inner
            .store
            .thread(thread_id)
            .ok_or_else(|| ChatError::ThreadNotFound(thread_id.to_string()))?;
        let current = thread.state.staging_selections.clone();
        let prior = thread.selections_before(thread.messages.len());

        self.inner.store.clear_staging_selections(thread_id)?;
        self.start_turn(thread_id, instructions, current, prior)
    }

    /// Replaces user message `index` and everything after it with a new turn.
    pub fn edit_user_message_and_stream_response(
        &self,
        thread_id: &str,
        index: usize,
        instructions: &str,
    ) -> Result<TurnHandle, ChatError> {
        let thread = self
            .inner
            .store
            .thread(thread_id)
            .ok_or_else(|| ChatError::ThreadNotFound(thread_id.to_string()))?;
        let message = thread
            .messages
            .get(index)
            .ok_or_else(|| ChatError::MessageOutOfRange {
                thread_id: thread_id.to_string(),
                index,
            })?;
        let ChatMessage::User {
            selections, state, ..
        } = message
        else {
            return Err(ChatError::NotAUserMessage {
                thread_id: thread_id.to_string(),
                index,
            });
        };

        let current = if state.is_being_edited {
            state.staging_selections.clone()
        } else {
            selections.clone()
        };
        let prior = thread.selections_before(index);

        self.cancel_streaming(thread_id)?;
        self.inner.store.truncate_messages(thread_id, index)?;
        self.start_turn(thread_id, instructions, current, prior)
    }

    /// Aborts the in-flight request, keeping its partial text as the
    /// assistant reply, and stops the turn from issuing further rounds.
    /// A no-op when nothing is running.
    pub fn cancel_streaming(&self, thread_id: &str) -> Result<(), ChatError> {
        let turn = self.inner.turns().by_thread.get(thread_id).map(|turn| turn.token.clone());
        if let Some(token) = turn {
            token.cancel();
        }

        if let Some(partial) = self.inner.streams.cancel(thread_id) {
            tracing::info!(thread_id, chars = partial.len(), "cancelled streaming response");
            self.inner
                .store
                .append_message(thread_id, ChatMessage::assistant(partial))?;
        }
        Ok(())
    }

    pub fn dismiss_stream_error(&self, thread_id: &str) {
        self.inner.streams.dismiss_error(thread_id);
    }

    fn start_turn(
        &self,
        thread_id: &str,
        instructions: &str,
        current: Vec<Selection>,
        prior: Vec<Selection>,
    ) -> Result<TurnHandle, ChatError> {
        self.cancel_streaming(thread_id)?;
        self.inner.streams.dismiss_error(thread_id);

        let lean = prompt::lean_content(instructions, &current);
        self.inner.store.append_message(
            thread_id,
            ChatMessage::user(lean, instructions.to_string(), current.clone()),
        )?;

        let (turn_id, token) = self.inner.register_turn(thread_id);
        // Tracked before spawning so a cancel that races the task start still
        // finds the request and finalizes the reply.
        let first_token = token.child_token();
        let first_request = self.inner.streams.begin_request(thread_id, first_token.clone());
        tracing::info!(
            thread_id,
            selections = current.len(),
            prior_selections = prior.len(),
            "starting turn"
        );

        let inner = Arc::clone(&self.inner);
        let task_thread_id = thread_id.to_string();
        let instructions = instructions.to_string();
        let join = tokio::spawn(async move {
            let workspace = Arc::clone(&inner.workspace);
            let full_content = tokio::task::spawn_blocking({
                let instructions = instructions.clone();
                move || prompt::full_content(&workspace, &instructions, &current, &prior)
            })
            .await
            .unwrap_or(instructions);

            inner
                .run_turn(
                    &task_thread_id,
                    &full_content,
                    &token,
                    (first_request, first_token),
                )
                .await;
            inner.finish_turn(&task_thread_id, turn_id);
        });

        Ok(TurnHandle {
            thread_id: thread_id.to_string(),
            join,
        })
    }
}

impl Inner {
    fn turns(&self) -> MutexGuard<'_, Turns> {
        self.turns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register_turn(&self, thread_id: &str) -> (u64, CancellationToken) {
        let mut turns = self.turns();
        turns.next_id += 1;
        let id = turns.next_id;
        let token = CancellationToken::new();
        if let Some(previous) = turns.by_thread.insert(
            thread_id.to_string(),
            Turn {
                id,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
        }
        (id, token)
    }

    fn finish_turn(&self, thread_id: &str, turn_id: u64) {
        let mut turns = self.turns();
        if turns
            .by_thread
            .get(thread_id)
            .is_some_and(|turn| turn.id == turn_id)
        {
            turns.by_thread.remove(thread_id);
        }
    }

    fn tools_enabled(&self) -> bool {
        self.options.chat_mode == ChatMode::Agent && !self.tools.is_empty()
    }

    /// `first` is the request already tracked by `start_turn`; later rounds
    /// begin their own.
    async fn run_turn(
        &self,
        thread_id: &str,
        full_content: &str,
        turn: &CancellationToken,
        first: (RequestId, CancellationToken),
    ) {
        let tools_enabled = self.tools_enabled();
        let system = prompt::system_prompt(tools_enabled);
        let mut tool_rounds = 0usize;
        let mut pending = Some(first);

        loop {
            let (request_id, request_token) = match pending.take() {
                Some(first) => first,
                None => {
                    if turn.is_cancelled() {
                        break;
                    }
                    let token = turn.child_token();
                    (self.streams.begin_request(thread_id, token.clone()), token)
                }
            };
            if turn.is_cancelled() {
                // Normally already finalized by `cancel_streaming`.
                if let Some(partial) = self.streams.finish_request(thread_id, request_id, None) {
                    self.append_or_report(thread_id, ChatMessage::assistant(partial));
                }
                break;
            }
            let Some(thread) = self.store.thread(thread_id) else {
                self.streams.finish_request(
                    thread_id,
                    request_id,
                    Some(StreamError::new(format!(
                        "thread {thread_id} no longer exists"
                    ))),
                );
                break;
            };

            let request = ModelRequest {
                messages: prompt::to_model_messages(&system, &thread.messages, full_content),
                tools: if tools_enabled {
                    self.tools.catalog()
                } else {
                    Vec::new()
                },
                cancel: request_token.clone(),
            };
            tracing::debug!(
                thread_id,
                messages = request.messages.len(),
                tools = request.tools.len(),
                round = tool_rounds,
                "requesting model response"
            );

            let message = match self
                .stream_response(thread_id, request_id, &request_token, request)
                .await
            {
                Outcome::Cancelled => break,
                Outcome::Failed(error) => {
                    tracing::warn!(thread_id, error = %error.message, "model response failed");
                    if let Some(partial) =
                        self.streams.finish_request(thread_id, request_id, Some(error))
                    {
                        self.append_or_report(thread_id, ChatMessage::assistant(partial));
                    }
                    break;
                }
                Outcome::Final(message) => message,
            };

            // A concurrent cancel may already have finalized this request.
            if self
                .streams
                .finish_request(thread_id, request_id, None)
                .is_none()
            {
                break;
            }
            if !self.append_or_report(thread_id, ChatMessage::assistant(message.text)) {
                break;
            }
            if message.tool_calls.is_empty() {
                break;
            }

            if !self.run_tools(thread_id, message.tool_calls, turn).await {
                break;
            }
            if turn.is_cancelled() {
                break;
            }
            tool_rounds += 1;
            if tool_rounds >= self.options.max_tool_rounds {
                tracing::warn!(thread_id, tool_rounds, "tool round limit reached");
                self.streams.set_error(
                    thread_id,
                    StreamError::new(format!(
                        "Stopped after {tool_rounds} tool rounds without a final answer"
                    )),
                );
                break;
            }
        }
        tracing::info!(thread_id, tool_rounds, "turn finished");
    }

    async fn stream_response(
        &self,
        thread_id: &str,
        request_id: RequestId,
        token: &CancellationToken,
        request: ModelRequest,
    ) -> Outcome {
        let mut stream = tokio::select! {
            _ = token.cancelled() => return Outcome::Cancelled,
            sent = self.transport.send(request) => match sent {
                Ok(stream) => stream,
                Err(TransportError::Cancelled) => return Outcome::Cancelled,
                Err(err) => return Outcome::Failed(StreamError::from_error(&err)),
            },
        };

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Outcome::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(TransportEvent::Text(delta))) => {
                    self.streams.append_text(thread_id, request_id, &delta);
                }
                Some(Ok(TransportEvent::Final(message))) => return Outcome::Final(message),
                Some(Err(err)) => return Outcome::Failed(StreamError::from_error(&*err)),
                None if token.is_cancelled() => return Outcome::Cancelled,
                None => {
                    return Outcome::Failed(StreamError::new(
                        "model stream ended without a final message",
                    ))
                }
            }
        }
    }

    /// Executes `calls` in order. Returns false when a call failed, which
    /// leaves a stream error on the thread.
    async fn run_tools(
        &self,
        thread_id: &str,
        calls: Vec<ToolCall>,
        turn: &CancellationToken,
    ) -> bool {
        for call in calls {
            if turn.is_cancelled() {
                return false;
            }
            tracing::debug!(thread_id, tool = %call.name, id = %call.id, "running tool");

            let shown = match self.tools.call(&call.name, &call.params).await {
                Ok(result) => self
                    .tools
                    .result_to_string(&call.name, &result)
                    .map(|content| (content, result)),
                Err(err) => Err(err),
            };
            let (content, result) = match shown {
                Ok(shown) => shown,
                Err(err) => {
                    tracing::warn!(thread_id, tool = %call.name, error = %err, "tool failed");
                    self.streams
                        .set_error(thread_id, StreamError::from_error(&err));
                    return false;
                }
            };

            // The thread may already hold a newer turn after an edit.
            if turn.is_cancelled() {
                tracing::debug!(thread_id, tool = %call.name, "dropping result of cancelled turn");
                return false;
            }
            let message = ChatMessage::Tool {
                name: call.name,
                params: call.params,
                id: call.id,
                content,
                result,
            };
            if !self.append_or_report(thread_id, message) {
                return false;
            }
        }
        true
    }

    fn append_or_report(&self, thread_id: &str, message: ChatMessage) -> bool {
        match self.store.append_message(thread_id, message) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(thread_id, error = %err, "failed to persist message");
                self.streams
                    .set_error(thread_id, StreamError::from_error(&err));
                false
            }
        }
    }
}
