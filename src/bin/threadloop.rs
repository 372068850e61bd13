use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use threadloop::agent::{ChatOptions, ChatThreadService};
use threadloop::api::AnthropicTransport;
use threadloop::config::Config;
use threadloop::events::ThreadsEvent;
use threadloop::storage::FileStorage;
use threadloop::tools::{workspace_tools, Workspace};
use threadloop::types::{ChatMessage, Selection};
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
commands:
  /new                 open a new thread
  /threads             list threads, most recent first
  /switch <id>         make <id> the current thread
  /show                print the current thread
  /attach <path>       attach a file to the next message
  /edit <idx> <text>   replace user message <idx> and resend
  /cancel              stop the running response
  /dismiss             clear the last stream error
  /quit                exit
anything else is sent as a message to the current thread";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    config.validate()?;

    let log_path = threadloop::logging::init(&config.data_dir);
    tracing::info!(
        model = %config.model,
        api_url = %config.api_url,
        chat_mode = ?config.chat_mode,
        "starting threadloop"
    );

    let storage = Arc::new(FileStorage::new(config.data_dir.clone()));
    let transport = Arc::new(AnthropicTransport::new(&config));
    let workspace = Arc::new(Workspace::new(config.working_dir.clone()));
    let tools = workspace_tools(Arc::clone(&workspace), config.tool_timeout);
    let service = ChatThreadService::new(
        storage,
        transport,
        tools,
        workspace,
        ChatOptions {
            chat_mode: config.chat_mode,
            max_tool_rounds: config.max_tool_rounds,
        },
    )?;

    println!("threadloop · {} · {}", config.model, config.working_dir.display());
    if let Some(path) = log_path {
        println!("log: {}", path.display());
    }
    println!("type /help for commands");

    tokio::spawn(print_updates(service.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match handle_line(&service, line) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => eprintln!("error: {err:#}"),
        }
    }

    let thread_id = service.store().current_thread_id();
    service.cancel_streaming(&thread_id)?;
    Ok(())
}

/// Returns `Ok(false)` when the user asked to quit.
fn handle_line(service: &ChatThreadService, line: &str) -> Result<bool> {
    let store = service.store();
    let thread_id = store.current_thread_id();

    let Some(command) = line.strip_prefix('/') else {
        service.add_user_message_and_stream_response(&thread_id, line)?;
        return Ok(true);
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(name, rest)| (name, rest.trim()))
        .unwrap_or((command, ""));

    match name {
        "quit" | "exit" => return Ok(false),
        "help" => println!("{HELP}"),
        "new" => {
            let id = store.open_new_thread()?;
            println!("thread {id}");
        }
        "threads" => {
            let snapshot = store.snapshot();
            for thread in snapshot.threads_by_recency() {
                let marker = if thread.id == snapshot.current_thread_id {
                    "*"
                } else {
                    " "
                };
                let preview = thread
                    .messages
                    .iter()
                    .find(|message| message.is_user())
                    .map(|message| first_line(message.display_content()))
                    .unwrap_or("(empty)");
                println!(
                    "{marker} {}  {}  {preview}",
                    thread.id,
                    thread.last_modified.format("%Y-%m-%d %H:%M")
                );
            }
        }
        "switch" => {
            if rest.is_empty() {
                bail!("usage: /switch <id>");
            }
            if store.thread(rest).is_none() {
                bail!("no thread with id {rest}");
            }
            store.switch_to_thread(rest);
        }
        "show" => {
            let thread = store.current_thread().context("no current thread")?;
            for (idx, message) in thread.messages.iter().enumerate() {
                println!("[{idx}] {}: {}", message.role(), message.display_content());
            }
        }
        "attach" => {
            if rest.is_empty() {
                bail!("usage: /attach <path>");
            }
            store.add_staging_selection(
                &thread_id,
                Selection::File {
                    file_uri: rest.to_string(),
                },
            )?;
        }
        "edit" => {
            let (index, text) = rest
                .split_once(char::is_whitespace)
                .context("usage: /edit <idx> <text>")?;
            let index: usize = index
                .parse()
                .with_context(|| format!("invalid message index '{index}'"))?;
            service.edit_user_message_and_stream_response(&thread_id, index, text.trim())?;
        }
        "cancel" => service.cancel_streaming(&thread_id)?,
        "dismiss" => service.dismiss_stream_error(&thread_id),
        other => bail!("unknown command /{other}; try /help"),
    }
    Ok(true)
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[derive(Default)]
struct Progress {
    printed: usize,
    error_shown: bool,
}

/// Echoes streamed text and tool activity for the current thread.
async fn print_updates(service: ChatThreadService) {
    let mut events = service.bus().subscribe_channel();
    let mut progress: HashMap<String, Progress> = HashMap::new();
    let mut seen_messages = service
        .store()
        .current_thread()
        .map(|thread| thread.messages.len())
        .unwrap_or(0);
    let mut seen_thread = service.store().current_thread_id();

    while let Some(event) = events.recv().await {
        match event {
            ThreadsEvent::StreamStateChanged { thread_id } => {
                let entry = progress.entry(thread_id.clone()).or_default();
                match service.stream_state(&thread_id) {
                    Some(state) if state.is_streaming() => {
                        let text = state.message_so_far.as_deref().unwrap_or("");
                        if text.len() < entry.printed {
                            entry.printed = 0;
                        }
                        if let Some(delta) = text.get(entry.printed..) {
                            print!("{delta}");
                            let _ = std::io::stdout().flush();
                        }
                        entry.printed = text.len();
                        entry.error_shown = false;
                    }
                    state => {
                        if entry.printed > 0 {
                            println!();
                            entry.printed = 0;
                        }
                        match state.and_then(|state| state.error) {
                            Some(error) if !entry.error_shown => {
                                eprintln!("stream error: {}", error.message);
                                entry.error_shown = true;
                            }
                            Some(_) => {}
                            None => entry.error_shown = false,
                        }
                    }
                }
            }
            ThreadsEvent::CurrentThreadChanged => {
                let Some(thread) = service.store().current_thread() else {
                    continue;
                };
                if thread.id != seen_thread {
                    seen_thread = thread.id.clone();
                    seen_messages = thread.messages.len();
                    println!("switched to {} ({} messages)", thread.id, seen_messages);
                    continue;
                }
                let start = seen_messages.min(thread.messages.len());
                for message in &thread.messages[start..] {
                    if let ChatMessage::Tool { name, content, .. } = message {
                        println!("[{name}] {}", first_line(content));
                    }
                }
                seen_messages = thread.messages.len();
            }
        }
    }
}
