use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type ThreadId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextRange {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

/// A piece of workspace context attached to a user turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Selection {
    /// An exact range inside a file, together with the quoted text.
    Selection {
        file_uri: String,
        range: TextRange,
        selection_str: String,
    },
    /// A whole file.
    File { file_uri: String },
}

impl Selection {
    pub fn file_uri(&self) -> &str {
        match self {
            Selection::Selection { file_uri, .. } | Selection::File { file_uri } => file_uri,
        }
    }

    /// Stable key used by `ThreadState::is_checked_of_selection_id`.
    pub fn id(&self) -> String {
        match self {
            Selection::File { file_uri } => file_uri.clone(),
            Selection::Selection {
                file_uri, range, ..
            } => format!(
                "{file_uri}:{}:{}-{}:{}",
                range.start_line, range.start_column, range.end_line, range.end_column
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserMessageState {
    #[serde(default)]
    pub staging_selections: Vec<Selection>,
    #[serde(default)]
    pub is_being_edited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: Option<String>,
        display_content: Option<String>,
        #[serde(default)]
        selections: Vec<Selection>,
        #[serde(default)]
        state: UserMessageState,
    },
    Assistant {
        content: Option<String>,
        display_content: Option<String>,
    },
    Tool {
        name: String,
        params: String,
        id: String,
        content: String,
        result: serde_json::Value,
    },
}

impl ChatMessage {
    pub fn user(content: String, display_content: String, selections: Vec<Selection>) -> Self {
        ChatMessage::User {
            content: Some(content),
            display_content: Some(display_content),
            selections,
            state: UserMessageState::default(),
        }
    }

    pub fn assistant(text: String) -> Self {
        ChatMessage::Assistant {
            content: Some(text.clone()),
            display_content: Some(text),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            ChatMessage::System { .. } => "system",
            ChatMessage::User { .. } => "user",
            ChatMessage::Assistant { .. } => "assistant",
            ChatMessage::Tool { .. } => "tool",
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, ChatMessage::User { .. })
    }

    /// Model-facing text; a null content reads as empty.
    pub fn content(&self) -> &str {
        match self {
            ChatMessage::System { content } | ChatMessage::Tool { content, .. } => content,
            ChatMessage::User { content, .. } | ChatMessage::Assistant { content, .. } => {
                content.as_deref().unwrap_or("")
            }
        }
    }

    /// Text to show in a transcript; falls back to nothing rather than the model content.
    pub fn display_content(&self) -> &str {
        match self {
            ChatMessage::System { content } | ChatMessage::Tool { content, .. } => content,
            ChatMessage::User {
                display_content, ..
            }
            | ChatMessage::Assistant {
                display_content, ..
            } => display_content.as_deref().unwrap_or(""),
        }
    }

    pub fn selections(&self) -> &[Selection] {
        match self {
            ChatMessage::User { selections, .. } => selections,
            _ => &[],
        }
    }

    pub fn user_state(&self) -> Option<&UserMessageState> {
        match self {
            ChatMessage::User { state, .. } => Some(state),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadState {
    #[serde(default)]
    pub staging_selections: Vec<Selection>,
    #[serde(default)]
    pub focused_message_idx: Option<usize>,
    #[serde(default)]
    pub is_checked_of_selection_id: HashMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatThread {
    pub id: ThreadId,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub state: ThreadState,
}

impl ChatThread {
    pub fn new(id: ThreadId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            last_modified: now,
            messages: Vec::new(),
            state: ThreadState::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The focused index, only when it points at a user message.
    pub fn focused_message_idx(&self) -> Option<usize> {
        let idx = self.state.focused_message_idx?;
        self.messages
            .get(idx)
            .and_then(ChatMessage::user_state)
            .map(|_| idx)
    }

    /// Selections attached to user messages in `messages[..end]`.
    pub fn selections_before(&self, end: usize) -> Vec<Selection> {
        self.messages[..end.min(self.messages.len())]
            .iter()
            .flat_map(|message| message.selections().iter().cloned())
            .collect()
    }
}

pub type ThreadMap = HashMap<ThreadId, ChatThread>;

/// Root aggregate. Only `all_threads` is persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadsState {
    pub all_threads: ThreadMap,
    pub current_thread_id: ThreadId,
}

impl ThreadsState {
    pub fn current_thread(&self) -> Option<&ChatThread> {
        self.all_threads.get(&self.current_thread_id)
    }

    /// Threads ordered most recently modified first.
    pub fn threads_by_recency(&self) -> Vec<&ChatThread> {
        let mut threads: Vec<&ChatThread> = self.all_threads.values().collect();
        threads.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| b.id.cmp(&a.id))
        });
        threads
    }
}
