use serde_json::json;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use threadloop::agent::{ChatOptions, ChatThreadService};
use threadloop::api::{ScriptedResponse, ScriptedTransport};
use threadloop::events::ChangeBus;
use threadloop::parser::{DIVIDER, FINAL, ORIGINAL};
use threadloop::state::migration::{THREAD_STORAGE_KEY, THREAD_VERSION_KEY};
use threadloop::state::ThreadStore;
use threadloop::storage::{FileStorage, KeyValueStorage, StorageScope, StorageTarget};
use threadloop::tools::{workspace_tools, Workspace};
use threadloop::types::{ChatMessage, ModelMessage, Selection, ToolCall};

fn start(
    data: &TempDir,
    work: &TempDir,
    responses: Vec<ScriptedResponse>,
) -> (ChatThreadService, ScriptedTransport) {
    let transport = ScriptedTransport::new(responses);
    let workspace = Arc::new(Workspace::new(work.path().to_path_buf()));
    let service = ChatThreadService::new(
        Arc::new(FileStorage::new(data.path())),
        Arc::new(transport.clone()),
        workspace_tools(Arc::clone(&workspace), Duration::from_secs(5)),
        workspace,
        ChatOptions::default(),
    )
    .expect("service starts");
    (service, transport)
}

#[tokio::test]
async fn test_edit_file_round_trip_persists_across_restart() {
    let data = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    fs::write(work.path().join("lib.rs"), "fn answer() -> u32 {\n    41\n}\n").unwrap();

    let blocks = format!("{ORIGINAL}\n    41\n{DIVIDER}\n    42\n{FINAL}");
    let (service, transport) = start(
        &data,
        &work,
        vec![
            ScriptedResponse::tool_calls(
                "Fixing the constant.",
                vec![ToolCall {
                    id: "toolu_1".into(),
                    name: "edit_file".into(),
                    params: json!({ "path": "lib.rs", "blocks": blocks }).to_string(),
                }],
            ),
            ScriptedResponse::text("Done: answer() now returns 42."),
        ],
    );
    let thread_id = service.store().current_thread_id();
    service
        .store()
        .add_staging_selection(
            &thread_id,
            Selection::File {
                file_uri: "lib.rs".into(),
            },
        )
        .unwrap();

    service
        .add_user_message_and_stream_response(&thread_id, "make it 42")
        .unwrap()
        .finished()
        .await;

    assert_eq!(
        fs::read_to_string(work.path().join("lib.rs")).unwrap(),
        "fn answer() -> u32 {\n    42\n}\n"
    );

    let first = transport.requests();
    assert_eq!(first.len(), 2);
    let sent_user = first[0]
        .messages
        .iter()
        .find(|message| matches!(message, ModelMessage::User { .. }))
        .expect("user message sent");
    assert!(sent_user.content().contains("    41"));
    assert!(!first[0].tools.is_empty());
    drop(service);

    let (reopened, _) = start(&data, &work, Vec::new());
    let thread = reopened.store().thread(&thread_id).expect("thread persisted");
    let roles: Vec<&str> = thread.messages.iter().map(ChatMessage::role).collect();
    assert_eq!(roles, vec!["user", "assistant", "tool", "assistant"]);
    assert_eq!(
        thread.messages[0].content(),
        "make it 42\n\nReferenced:\n- lib.rs"
    );
    assert_eq!(thread.messages[0].display_content(), "make it 42");
    assert_eq!(
        thread.messages[3].content(),
        "Done: answer() now returns 42."
    );
    assert!(thread.state.staging_selections.is_empty());
    assert_ne!(reopened.store().current_thread_id(), thread_id);
}

#[tokio::test]
async fn test_edit_resends_history_up_to_the_edited_message() {
    let data = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let (service, transport) = start(
        &data,
        &work,
        vec![
            ScriptedResponse::text("first answer"),
            ScriptedResponse::text("second answer"),
            ScriptedResponse::text("rewritten answer"),
        ],
    );
    let thread_id = service.store().current_thread_id();

    for prompt in ["one", "two"] {
        service
            .add_user_message_and_stream_response(&thread_id, prompt)
            .unwrap()
            .finished()
            .await;
    }
    service
        .edit_user_message_and_stream_response(&thread_id, 2, "two, but better")
        .unwrap()
        .finished()
        .await;

    let thread = service.store().thread(&thread_id).unwrap();
    let contents: Vec<&str> = thread.messages.iter().map(ChatMessage::content).collect();
    assert_eq!(
        contents,
        vec!["one", "first answer", "two, but better", "rewritten answer"]
    );

    let last = transport.requests().pop().unwrap();
    let sent: Vec<&str> = last.messages[1..].iter().map(ModelMessage::content).collect();
    assert_eq!(sent, vec!["one", "first answer", "two, but better"]);
}

#[test]
fn test_v1_document_on_disk_is_upgraded() {
    let data = TempDir::new().unwrap();
    let storage = Arc::new(FileStorage::new(data.path()));
    let v1 = json!({
        "t1": {
            "id": "t1",
            "created_at": "2024-01-01T00:00:00Z",
            "last_modified": "2024-01-02T00:00:00Z",
            "messages": [
                { "role": "user", "content": "hi", "display_content": "hi" },
                { "role": "assistant", "content": "hello", "display_content": "hello" }
            ]
        }
    });
    storage
        .store(
            THREAD_STORAGE_KEY,
            &v1.to_string(),
            StorageScope::Application,
            StorageTarget::User,
        )
        .unwrap();
    storage
        .store(
            THREAD_VERSION_KEY,
            "v1",
            StorageScope::Application,
            StorageTarget::User,
        )
        .unwrap();

    let store = ThreadStore::open(storage.clone(), ChangeBus::new()).unwrap();
    let thread = store.thread("t1").expect("v1 thread survives");
    assert_eq!(thread.messages.len(), 2);
    assert!(thread.messages[0].user_state().is_some());

    let reloaded = FileStorage::new(data.path());
    assert_eq!(
        reloaded
            .get(THREAD_VERSION_KEY, StorageScope::Application)
            .as_deref(),
        Some("v2")
    );
}
