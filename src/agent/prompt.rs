//! Turns a thread's history plus attached selections into model messages.

use crate::tools::Workspace;
use crate::types::{ChatMessage, ModelMessage, Selection};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;

const MAX_FILE_CHARS: usize = 50_000;

pub const BASE_SYSTEM_PROMPT: &str = "You are a coding assistant working inside the user's workspace.\n\
Answer precisely and keep explanations short.\n\
When the user attaches selections, treat their contents as the current state of those files.";

pub const AGENT_SYSTEM_PROMPT: &str = "\n\
Use tools for all filesystem facts and changes; never guess file contents.\n\
After each tool result, reassess the task and either call the next needed tool or give the final answer.\n\
Prefer search_files for targeted matches and read_file only when the whole file is needed.\n\
For code edits use edit_file with search/replace blocks whose ORIGINAL text matches the file exactly once.\n\
Never claim a file was read or changed unless the corresponding tool call succeeded.\n\
Avoid repeating identical tool calls without new evidence.";

pub fn system_prompt(tools_enabled: bool) -> String {
    if tools_enabled {
        format!("{BASE_SYSTEM_PROMPT}{AGENT_SYSTEM_PROMPT}")
    } else {
        BASE_SYSTEM_PROMPT.to_string()
    }
}

pub fn selection_label(selection: &Selection) -> String {
    match selection {
        Selection::File { file_uri } => file_uri.clone(),
        Selection::Selection {
            file_uri, range, ..
        } => format!(
            "{file_uri} (lines {}-{})",
            range.start_line, range.end_line
        ),
    }
}

/// What gets persisted as the user message: the instructions plus a list of
/// what was referenced, without file contents.
pub fn lean_content(instructions: &str, current: &[Selection]) -> String {
    if current.is_empty() {
        return instructions.to_string();
    }
    let mut content = instructions.to_string();
    content.push_str("\n\nReferenced:");
    for selection in current {
        let _ = write!(content, "\n- {}", selection_label(selection));
    }
    content
}

/// What the model sees for the newest user message: the instructions plus
/// the contents of current selections and of earlier selections that are not
/// attached again. Reads the filesystem.
pub fn full_content(
    workspace: &Workspace,
    instructions: &str,
    current: &[Selection],
    prior: &[Selection],
) -> String {
    let mut content = instructions.to_string();

    let mut seen: HashSet<String> = HashSet::new();
    let current: Vec<&Selection> = current
        .iter()
        .filter(|selection| seen.insert(selection.id()))
        .collect();
    let prior: Vec<&Selection> = prior
        .iter()
        .filter(|selection| seen.insert(selection.id()))
        .collect();

    if !current.is_empty() {
        content.push_str("\n\n# Selections\n");
        for selection in current {
            push_selection(&mut content, workspace, selection);
        }
    }
    if !prior.is_empty() {
        content.push_str("\n\n# Selections from earlier in this thread\n");
        for selection in prior {
            push_selection(&mut content, workspace, selection);
        }
    }
    content
}

fn push_selection(out: &mut String, workspace: &Workspace, selection: &Selection) {
    let body = match selection {
        Selection::Selection { selection_str, .. } => selection_str.clone(),
        Selection::File { file_uri } => match workspace.read_uri(file_uri) {
            Ok(text) => truncate_chars(text, MAX_FILE_CHARS),
            Err(err) => {
                tracing::warn!(file_uri = %file_uri, error = %err, "could not read selected file");
                format!("(unable to read file: {err:#})")
            }
        },
    };
    let language = Path::new(selection.file_uri())
        .extension()
        .map(|ext| ext.to_string_lossy().to_string())
        .unwrap_or_default();

    let _ = write!(
        out,
        "\n{}\n```{language}\n{}\n```\n",
        selection_label(selection),
        body.trim_end_matches('\n')
    );
}

fn truncate_chars(text: String, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}\n... (truncated)", &text[..cut]),
        None => text,
    }
}

/// System prompt first, then the history. The newest user message carries
/// `full_content` in place of its persisted text.
pub fn to_model_messages(
    system: &str,
    history: &[ChatMessage],
    full_content: &str,
) -> Vec<ModelMessage> {
    let last_user = history.iter().rposition(ChatMessage::is_user);
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ModelMessage::System {
        content: system.to_string(),
    });

    for (idx, message) in history.iter().enumerate() {
        messages.push(match message {
            ChatMessage::System { content } => ModelMessage::System {
                content: content.clone(),
            },
            ChatMessage::User { .. } if Some(idx) == last_user => ModelMessage::User {
                content: full_content.to_string(),
            },
            ChatMessage::User { .. } => ModelMessage::User {
                content: message.content().to_string(),
            },
            ChatMessage::Assistant { .. } => ModelMessage::Assistant {
                content: message.content().to_string(),
            },
            ChatMessage::Tool {
                name,
                params,
                id,
                content,
                ..
            } => ModelMessage::Tool {
                id: id.clone(),
                name: name.clone(),
                params: params.clone(),
                content: content.clone(),
            },
        });
    }
    messages
}
