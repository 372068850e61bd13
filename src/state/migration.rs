//! Forward migration of the persisted thread map.
//!
//! Migration works on raw JSON so older documents that would not deserialize
//! into the current types can still be upgraded.

use serde_json::{json, Map, Value};

pub const THREAD_VERSION_KEY: &str = "threadloop.threadVersion";
pub const THREAD_STORAGE_KEY: &str = "threadloop.threadStorage";

pub const CURRENT_VERSION: &str = "v2";
const V1: &str = "v1";

/// Returns the upgraded thread map, or `None` when `threads` is already in the
/// current format. An unknown or missing version resets to an empty map.
pub fn migrate(threads: &Value, from_version: Option<&str>) -> Option<Value> {
    match from_version {
        Some(CURRENT_VERSION) => None,
        Some(V1) => Some(migrate_v1(threads)),
        _ => Some(Value::Object(Map::new())),
    }
}

/// v1 threads had no `state` records on threads or user messages.
fn migrate_v1(threads: &Value) -> Value {
    let Some(thread_map) = threads.as_object() else {
        return Value::Object(Map::new());
    };

    let mut migrated = Map::new();
    for (id, thread) in thread_map {
        let mut thread = thread.clone();
        if let Some(fields) = thread.as_object_mut() {
            fill_defaults(
                fields,
                "state",
                json!({
                    "staging_selections": [],
                    "focused_message_idx": null,
                    "is_checked_of_selection_id": {},
                }),
            );
            if let Some(messages) = fields.get_mut("messages").and_then(Value::as_array_mut) {
                messages.iter_mut().for_each(migrate_v1_message);
            }
        }
        migrated.insert(id.clone(), thread);
    }
    Value::Object(migrated)
}

fn migrate_v1_message(message: &mut Value) {
    let Some(fields) = message.as_object_mut() else {
        return;
    };
    if fields.get("role").and_then(Value::as_str) != Some("user") {
        return;
    }
    if fields.get("selections").map_or(true, Value::is_null) {
        fields.insert("selections".to_string(), json!([]));
    }
    fill_defaults(
        fields,
        "state",
        json!({ "staging_selections": [], "is_being_edited": false }),
    );
}

/// Inserts `defaults` under `key`, or fills whichever default fields an
/// existing object lacks.
fn fill_defaults(fields: &mut Map<String, Value>, key: &str, defaults: Value) {
    let Value::Object(defaults) = defaults else {
        return;
    };
    let slot = fields
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    if let Some(existing) = slot.as_object_mut() {
        for (field, value) in defaults {
            existing.entry(field).or_insert(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ThreadMap;

    fn v1_document() -> Value {
        json!({
            "2024-01-01T00:00:00.000000Z": {
                "id": "2024-01-01T00:00:00.000000Z",
                "created_at": "2024-01-01T00:00:00Z",
                "last_modified": "2024-01-01T00:05:00Z",
                "messages": [
                    { "role": "user", "content": "hi", "display_content": "hi", "selections": null },
                    { "role": "assistant", "content": "hello", "display_content": "hello" }
                ]
            }
        })
    }

    #[test]
    fn test_current_version_is_not_migrated() {
        assert_eq!(migrate(&json!({}), Some(CURRENT_VERSION)), None);
    }

    #[test]
    fn test_unknown_or_missing_version_resets() {
        assert_eq!(migrate(&v1_document(), None), Some(json!({})));
        assert_eq!(migrate(&v1_document(), Some("v0")), Some(json!({})));
    }

    #[test]
    fn test_v1_fills_state_and_deserializes() {
        let migrated = migrate(&v1_document(), Some(V1)).expect("v1 migrates");
        let threads: ThreadMap = serde_json::from_value(migrated).expect("current format");
        let thread = threads.values().next().unwrap();
        assert_eq!(thread.state.focused_message_idx, None);
        let user_state = thread.messages[0].user_state().expect("user state");
        assert!(!user_state.is_being_edited);
        assert!(thread.messages[0].selections().is_empty());
    }

    #[test]
    fn test_v1_migration_is_idempotent() {
        let once = migrate(&v1_document(), Some(V1)).unwrap();
        let twice = migrate(&once, Some(V1)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_v1_keeps_existing_partial_state() {
        let document = json!({
            "t": {
                "id": "t",
                "messages": [],
                "state": { "focused_message_idx": 3 }
            }
        });
        let migrated = migrate(&document, Some(V1)).unwrap();
        assert_eq!(migrated["t"]["state"]["focused_message_idx"], json!(3));
        assert_eq!(migrated["t"]["state"]["staging_selections"], json!([]));
    }
}
